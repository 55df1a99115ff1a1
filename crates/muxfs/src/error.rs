//! Error types.
//!
//! Every fallible operation returns exactly one [`VfsError`]. Callers that
//! need a stable classification (for example to map onto an external
//! protocol) use [`VfsError::kind`].

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle::HandleId;

/// Stable error classification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    PermissionDenied,
    UnknownPluginType,
    AlreadyRegistered,
    PluginInitFailed,
    InvalidPlugin,
    LoadFailed,
    InUse,
    Busy,
    TimedOut,
    Unsupported,
    Backend,
}

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Malformed path, bad flags or an otherwise unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// No mount is installed at exactly this path.
    #[error("not mounted: {0}")]
    NotMounted(String),

    /// The handle id was never issued or has already been closed.
    #[error("unknown handle: {0}")]
    UnknownHandle(HandleId),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Filesystem is read-only.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// Path escapes the backend root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Source and destination live on different mounts.
    #[error("cross-mount rename: {from} -> {to}")]
    CrossMount { from: String, to: String },

    /// No factory registered under this plugin type name.
    #[error("unknown plugin type: {0}")]
    UnknownPluginType(String),

    /// A plugin type with this name is already registered.
    #[error("plugin already registered: {0}")]
    AlreadyRegistered(String),

    /// The factory rejected its configuration or could not build an instance.
    #[error("plugin {plugin} failed to initialize: {message}")]
    PluginInitFailed { plugin: String, message: String },

    /// The module does not expose a conforming plugin declaration.
    #[error("invalid plugin {}: {reason}", path.display())]
    InvalidPlugin { path: PathBuf, reason: String },

    /// The module could not be loaded at all.
    #[error("failed to load {}: {message}", path.display())]
    LoadFailed { path: PathBuf, message: String },

    /// A plugin module is still referenced by live mounts.
    #[error("in use: {0}")]
    InUse(String),

    /// A mount still has instances lent out.
    #[error("busy: {0}")]
    Busy(String),

    /// Pool acquisition deadline exceeded.
    #[error("timed out after {waited:?} waiting for an instance of {mount}")]
    TimedOut { mount: String, waited: Duration },

    /// The backend does not implement an optional capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Failure surfaced from a plugin, tagged with where it happened.
    #[error("{mount}: {op} failed: {message}")]
    Backend {
        mount: String,
        op: &'static str,
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other backend error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an Unsupported error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VfsError::InvalidArgument(_)
            | VfsError::PathEscapesRoot(_)
            | VfsError::CrossMount { .. } => ErrorKind::InvalidArgument,
            VfsError::NotFound(_) | VfsError::NotMounted(_) | VfsError::UnknownHandle(_) => {
                ErrorKind::NotFound
            }
            VfsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            VfsError::NotADirectory(_) => ErrorKind::NotADirectory,
            VfsError::IsADirectory(_) => ErrorKind::IsADirectory,
            VfsError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            VfsError::PermissionDenied(_) | VfsError::ReadOnly => ErrorKind::PermissionDenied,
            VfsError::UnknownPluginType(_) => ErrorKind::UnknownPluginType,
            VfsError::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            VfsError::PluginInitFailed { .. } => ErrorKind::PluginInitFailed,
            VfsError::InvalidPlugin { .. } => ErrorKind::InvalidPlugin,
            VfsError::LoadFailed { .. } => ErrorKind::LoadFailed,
            VfsError::InUse(_) => ErrorKind::InUse,
            VfsError::Busy(_) => ErrorKind::Busy,
            VfsError::TimedOut { .. } => ErrorKind::TimedOut,
            VfsError::Unsupported(_) => ErrorKind::Unsupported,
            VfsError::Io(e) => io_kind(e.kind()),
            VfsError::Backend { .. } | VfsError::Other(_) => ErrorKind::Backend,
        }
    }

    /// Attach mount and operation context to an error coming out of a backend.
    ///
    /// Classified errors keep their variant so callers can still match on
    /// them; opaque failures become [`VfsError::Backend`].
    pub fn in_mount(self, mount: &str, op: &'static str) -> Self {
        match self {
            VfsError::Other(message) => VfsError::Backend {
                mount: mount.to_string(),
                op,
                message,
            },
            VfsError::Io(e) if io_kind(e.kind()) == ErrorKind::Backend => VfsError::Backend {
                mount: mount.to_string(),
                op,
                message: e.to_string(),
            },
            other => other,
        }
    }
}

fn io_kind(kind: io::ErrorKind) -> ErrorKind {
    match kind {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
            ErrorKind::PermissionDenied
        }
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::NotADirectory => ErrorKind::NotADirectory,
        io::ErrorKind::IsADirectory => ErrorKind::IsADirectory,
        io::ErrorKind::DirectoryNotEmpty => ErrorKind::DirectoryNotEmpty,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidFilename => {
            ErrorKind::InvalidArgument
        }
        io::ErrorKind::TimedOut => ErrorKind::TimedOut,
        io::ErrorKind::Unsupported => ErrorKind::Unsupported,
        _ => ErrorKind::Backend,
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_of_handle_error_is_not_found() {
        let err = VfsError::UnknownHandle(7);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "unknown handle: 7");
    }

    #[test]
    fn test_io_errors_keep_their_kind() {
        let err = VfsError::from(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = VfsError::from(io::Error::other("disk on fire"));
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn test_in_mount_wraps_opaque_errors_only() {
        let wrapped = VfsError::other("connection reset").in_mount("/s3", "read");
        assert_eq!(wrapped.kind(), ErrorKind::Backend);
        assert_eq!(wrapped.to_string(), "/s3: read failed: connection reset");

        let kept = VfsError::not_found("a.txt").in_mount("/s3", "read");
        assert!(matches!(kept, VfsError::NotFound(_)));
    }

    #[test]
    fn test_kind_string_forms() {
        assert_eq!(ErrorKind::UnknownPluginType.to_string(), "unknown_plugin_type");
        let parsed: ErrorKind = "timed_out".parse().unwrap();
        assert_eq!(parsed, ErrorKind::TimedOut);
    }
}
