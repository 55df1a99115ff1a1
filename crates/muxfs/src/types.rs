//! Core VFS types.
//!
//! Path-based and serializable, so an outer boundary can hand them to
//! callers that never see the Rust types.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{VfsError, VfsResult};

/// File metadata as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry name (last path segment, empty for a backend root).
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Unix permission bits (e.g. 0o644).
    pub mode: u32,
    /// Last modification time.
    pub mod_time: SystemTime,
    /// True for directories.
    pub is_dir: bool,
}

impl FileInfo {
    /// Metadata for a regular file modified now.
    pub fn file(name: impl Into<String>, size: u64, mode: u32) -> Self {
        Self {
            name: name.into(),
            size,
            mode,
            mod_time: SystemTime::now(),
            is_dir: false,
        }
    }

    /// Metadata for a directory modified now.
    pub fn directory(name: impl Into<String>, mode: u32) -> Self {
        Self {
            name: name.into(),
            size: 0,
            mode,
            mod_time: SystemTime::now(),
            is_dir: true,
        }
    }

    /// Same metadata under a different name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

bitflags! {
    /// Flags for path-based writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WriteFlags: u32 {
        /// Create the file if it does not exist.
        const CREATE = 1 << 0;
        /// Truncate the file before writing.
        const TRUNCATE = 1 << 1;
        /// Write at the end of the file, ignoring the offset.
        const APPEND = 1 << 2;
    }
}

impl Default for WriteFlags {
    fn default() -> Self {
        WriteFlags::empty()
    }
}

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

// Linux open(2) values; the wire format callers already speak.
const O_ACCMODE: i32 = 0o3;
const O_WRONLY: i32 = 0o1;
const O_RDWR: i32 = 0o2;
const O_CREAT: i32 = 0o100;
const O_EXCL: i32 = 0o200;
const O_TRUNC: i32 = 0o1000;
const O_APPEND: i32 = 0o2000;

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::create()
        }
    }

    /// Create and truncate.
    pub fn create_truncate() -> Self {
        Self {
            truncate: true,
            ..Self::create()
        }
    }

    /// Append, creating the file if needed.
    pub fn append() -> Self {
        Self {
            append: true,
            ..Self::create()
        }
    }

    /// Decode conventional `open(2)` integer flags.
    pub fn from_posix(flags: i32) -> VfsResult<Self> {
        let (read, write) = match flags & O_ACCMODE {
            0 => (true, false),
            O_WRONLY => (false, true),
            O_RDWR => (true, true),
            _ => {
                return Err(VfsError::invalid_argument(format!(
                    "bad access mode in flags {flags:#o}"
                )));
            }
        };
        Ok(Self {
            read,
            write,
            append: flags & O_APPEND != 0,
            create: flags & O_CREAT != 0,
            truncate: flags & O_TRUNC != 0,
            exclusive: flags & O_EXCL != 0,
        })
    }

    /// Encode back to `open(2)` integer flags.
    pub fn to_posix(&self) -> i32 {
        let mut flags = match (self.read, self.write) {
            (_, false) => 0,
            (false, true) => O_WRONLY,
            (true, true) => O_RDWR,
        };
        if self.append {
            flags |= O_APPEND;
        }
        if self.create {
            flags |= O_CREAT;
        }
        if self.truncate {
            flags |= O_TRUNC;
        }
        if self.exclusive {
            flags |= O_EXCL;
        }
        flags
    }

    /// Whether the handle may be written through.
    pub fn writable(&self) -> bool {
        self.write || self.append
    }
}

/// Reference point for a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    /// From the start of the file.
    Start,
    /// From the current cursor.
    Current,
    /// From the end of the file.
    End,
}

impl TryFrom<i32> for Whence {
    type Error = VfsError;

    fn try_from(value: i32) -> VfsResult<Self> {
        match value {
            0 => Ok(Whence::Start),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(VfsError::invalid_argument(format!("bad whence {other}"))),
        }
    }
}

/// Compute the cursor after a seek, rejecting positions before the start.
pub fn seek_position(cursor: u64, len: u64, offset: i64, whence: Whence) -> VfsResult<u64> {
    let base = match whence {
        Whence::Start => 0,
        Whence::Current => cursor,
        Whence::End => len,
    };
    base.checked_add_signed(offset)
        .ok_or_else(|| VfsError::invalid_argument(format!("seek to {base} + {offset}")))
}

/// Opaque per-mount configuration handed to a plugin factory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountConfig(BTreeMap<String, JsonValue>);

impl MountConfig {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw value for a key.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// String value for a key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    /// Boolean value for a key.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(JsonValue::as_bool)
    }

    /// Unsigned integer value for a key.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(JsonValue::as_u64)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, JsonValue>> for MountConfig {
    fn from(map: BTreeMap<String, JsonValue>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, JsonValue)> for MountConfig {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Summary of an installed mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    /// Normalized mount path.
    pub path: String,
    /// Plugin type name backing the mount.
    pub plugin: String,
}

/// Where a registered plugin type came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PluginSource {
    /// Compiled into the process.
    Builtin,
    /// Loaded from a module on disk.
    Dynamic { path: PathBuf },
}

/// A loaded plugin module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Path the module was loaded from.
    pub path: PathBuf,
    /// Plugin type name it registered.
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_info_constructors() {
        let file = FileInfo::file("a.txt", 1024, 0o644);
        assert!(!file.is_dir);
        assert_eq!(file.size, 1024);
        assert_eq!(file.mode, 0o644);

        let dir = FileInfo::directory("sub", 0o755).with_name("renamed");
        assert!(dir.is_dir);
        assert_eq!(dir.name, "renamed");
    }

    #[test]
    fn test_open_flags() {
        let read = OpenFlags::read();
        assert!(read.read);
        assert!(!read.writable());

        let create = OpenFlags::create_exclusive();
        assert!(create.create);
        assert!(create.exclusive);
        assert!(create.write);
    }

    #[test]
    fn test_open_flags_posix() {
        let flags = OpenFlags::from_posix(O_RDWR | O_CREAT | O_TRUNC).unwrap();
        assert_eq!(flags, OpenFlags::create_truncate());
        assert_eq!(flags.to_posix(), O_RDWR | O_CREAT | O_TRUNC);

        let wronly = OpenFlags::from_posix(O_WRONLY | O_APPEND).unwrap();
        assert!(!wronly.read);
        assert!(wronly.append);

        assert!(OpenFlags::from_posix(O_ACCMODE).is_err());
    }

    #[test]
    fn test_whence_and_seek() {
        assert_eq!(Whence::try_from(2).unwrap(), Whence::End);
        assert!(Whence::try_from(3).is_err());

        assert_eq!(seek_position(4, 10, 2, Whence::Current).unwrap(), 6);
        assert_eq!(seek_position(4, 10, -3, Whence::End).unwrap(), 7);
        assert_eq!(seek_position(4, 10, 20, Whence::Start).unwrap(), 20);
        assert!(seek_position(4, 10, -5, Whence::Current).is_err());
    }

    #[test]
    fn test_mount_config_accessors() {
        let config = MountConfig::new()
            .with("local_dir", "/tmp/data")
            .with("read_only", true)
            .with("max", 3);
        assert_eq!(config.get_str("local_dir"), Some("/tmp/data"));
        assert_eq!(config.get_bool("read_only"), Some(true));
        assert_eq!(config.get_u64("max"), Some(3));
        assert!(config.get("missing").is_none());

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"local_dir":"/tmp/data","max":3,"read_only":true}"#);
    }
}
