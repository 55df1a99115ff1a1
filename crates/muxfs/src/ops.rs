//! The capability interface every backend implements.
//!
//! Operations are path-based. Paths handed to a backend are always
//! relative to the backend's own root: the mount table strips the mount
//! prefix before calling in, so the backend root is the empty path.

use async_trait::async_trait;
use bitflags::bitflags;
use std::path::Path;

use crate::error::{VfsError, VfsResult};
use crate::types::{FileInfo, OpenFlags, Whence, WriteFlags};

bitflags! {
    /// Operation groups a backend answers to.
    ///
    /// A read-only backend still answers the write group (with
    /// [`VfsError::ReadOnly`]); the flags describe the interface, not
    /// permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const READ_DIR = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const CREATE = 1 << 3;
        const MKDIR = 1 << 4;
        const REMOVE = 1 << 5;
        const RENAME = 1 << 6;
        const CHMOD = 1 << 7;
        const TOUCH = 1 << 8;
        const STAT = 1 << 9;
        /// Optional stateful-handle sub-interface.
        const HANDLES = 1 << 10;

        /// Everything a conforming backend must provide.
        const REQUIRED = Self::READ_DIR.bits()
            | Self::READ.bits()
            | Self::WRITE.bits()
            | Self::CREATE.bits()
            | Self::MKDIR.bits()
            | Self::REMOVE.bits()
            | Self::RENAME.bits()
            | Self::CHMOD.bits()
            | Self::TOUCH.bits()
            | Self::STAT.bits();
    }
}

/// Core backend operations.
#[async_trait]
pub trait VfsOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// List a directory, ordered by name.
    async fn read_dir(&self, path: &Path) -> VfsResult<Vec<FileInfo>>;

    /// Read up to `size` bytes starting at `offset`.
    ///
    /// Returns fewer bytes (possibly none) at end of file; that is not an
    /// error.
    async fn read(&self, path: &Path, offset: u64, size: u64) -> VfsResult<Vec<u8>>;

    /// Get file metadata.
    async fn stat(&self, path: &Path) -> VfsResult<FileInfo>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write `data` at `offset` (or at the end with [`WriteFlags::APPEND`]).
    ///
    /// Returns the number of bytes written.
    async fn write(&self, path: &Path, data: &[u8], offset: u64, flags: WriteFlags)
    -> VfsResult<u64>;

    /// Create an empty file, truncating an existing one.
    async fn create(&self, path: &Path) -> VfsResult<()>;

    /// Create a directory.
    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()>;

    /// Remove a file or an empty directory.
    async fn remove(&self, path: &Path) -> VfsResult<()>;

    /// Remove a file or a directory and everything below it.
    async fn remove_all(&self, path: &Path) -> VfsResult<()>;

    /// Rename a file or directory within this backend.
    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()>;

    /// Change permission bits.
    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()>;

    /// Update the modification time, creating an empty file if absent.
    async fn touch(&self, path: &Path) -> VfsResult<()>;

    // ========================================================================
    // Handles (optional)
    // ========================================================================

    /// Open a stateful handle.
    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32)
    -> VfsResult<Box<dyn FileHandle>> {
        let _ = (flags, mode);
        Err(VfsError::unsupported(format!(
            "handles on {}",
            path.display()
        )))
    }

    // ========================================================================
    // Metadata and lifecycle
    // ========================================================================

    /// Operation groups this backend implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::REQUIRED
    }

    /// Returns true if this filesystem refuses writes.
    fn read_only(&self) -> bool {
        false
    }

    /// False once the instance is permanently broken (for example its
    /// connection is gone). The pool destroys unhealthy instances instead
    /// of lending them again.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Release backend resources. Called once, after the instance left
    /// service.
    async fn shutdown(&self) -> VfsResult<()> {
        Ok(())
    }

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Check if a path exists.
    async fn exists(&self, path: &Path) -> bool {
        self.stat(path).await.is_ok()
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>> {
        let info = self.stat(path).await?;
        self.read(path, 0, info.size).await
    }
}

/// An open, cursor-bearing file.
///
/// A handle belongs to the backend instance that opened it and is never
/// moved to another instance.
#[async_trait]
pub trait FileHandle: Send + Sync {
    /// Read up to `size` bytes at the cursor and advance it.
    async fn read(&mut self, size: u64) -> VfsResult<Vec<u8>>;

    /// Read up to `size` bytes at `offset` without moving the cursor.
    async fn read_at(&mut self, size: u64, offset: u64) -> VfsResult<Vec<u8>>;

    /// Write at the cursor and advance it.
    async fn write(&mut self, data: &[u8]) -> VfsResult<u64>;

    /// Write at `offset` without moving the cursor.
    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<u64>;

    /// Move the cursor; returns the new position.
    async fn seek(&mut self, offset: i64, whence: Whence) -> VfsResult<u64>;

    /// Persist buffered state.
    async fn sync(&mut self) -> VfsResult<()> {
        Ok(())
    }

    /// Metadata of the open file.
    async fn stat(&mut self) -> VfsResult<FileInfo>;

    /// Release backend-side resources. Called exactly once.
    async fn close(&mut self) -> VfsResult<()>;
}
