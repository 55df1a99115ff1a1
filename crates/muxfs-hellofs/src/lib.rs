//! `hellofs`: a read-only muxfs plugin serving one file.
//!
//! Build as a `cdylib` and load it at runtime:
//!
//! ```no_run
//! # async fn example() -> muxfs::VfsResult<()> {
//! let fs = muxfs::MountableFs::new();
//! fs.load_plugin("target/release/libmuxfs_hellofs.so").await?;
//! fs.mount("/hello", "hellofs", muxfs::MountConfig::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use muxfs::{
    FileInfo, InstanceFactory, MountConfig, PluginFactory, VfsError, VfsOps, VfsResult, WriteFlags,
};

/// Plugin type name.
pub const NAME: &str = "hellofs";

/// Name of the only file.
pub const FILE_NAME: &str = "hello";

/// Contents of the only file.
pub const CONTENTS: &[u8] = b"Hello, World!\n";

muxfs::declare_plugin!(NAME, HelloFs::factory());

/// The backend. Stateless, so every instance is identical.
#[derive(Debug, Clone)]
pub struct HelloFs {
    started: SystemTime,
}

impl HelloFs {
    pub fn new() -> Self {
        Self {
            started: SystemTime::now(),
        }
    }

    pub fn factory() -> impl PluginFactory + 'static {
        |config: &MountConfig| -> VfsResult<Arc<dyn InstanceFactory>> {
            if !config.is_empty() {
                return Err(VfsError::invalid_argument("hellofs takes no configuration"));
            }
            Ok(Arc::new(|| -> VfsResult<Box<dyn VfsOps>> {
                Ok(Box::new(HelloFs::new()))
            }))
        }
    }

    fn root(&self) -> FileInfo {
        FileInfo {
            name: String::new(),
            size: 0,
            mode: 0o555,
            mod_time: self.started,
            is_dir: true,
        }
    }

    fn file(&self) -> FileInfo {
        FileInfo {
            name: FILE_NAME.to_string(),
            size: CONTENTS.len() as u64,
            mode: 0o444,
            mod_time: self.started,
            is_dir: false,
        }
    }

    fn lookup(&self, path: &Path) -> VfsResult<FileInfo> {
        let path = path.strip_prefix("/").unwrap_or(path);
        if path.as_os_str().is_empty() {
            Ok(self.root())
        } else if path == Path::new(FILE_NAME) {
            Ok(self.file())
        } else {
            Err(VfsError::not_found(path.display().to_string()))
        }
    }

    /// Mutations on an existing entry are refused as read-only; anything
    /// else does not exist.
    fn refuse(&self, path: &Path) -> VfsError {
        match self.lookup(path) {
            Ok(_) => VfsError::ReadOnly,
            Err(e) => e,
        }
    }
}

impl Default for HelloFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VfsOps for HelloFs {
    async fn read_dir(&self, path: &Path) -> VfsResult<Vec<FileInfo>> {
        let info = self.lookup(path)?;
        if !info.is_dir {
            return Err(VfsError::not_a_directory(path.display().to_string()));
        }
        Ok(vec![self.file()])
    }

    async fn read(&self, path: &Path, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        let info = self.lookup(path)?;
        if info.is_dir {
            return Err(VfsError::is_a_directory(path.display().to_string()));
        }
        let start = (offset as usize).min(CONTENTS.len());
        let end = start.saturating_add(size as usize).min(CONTENTS.len());
        Ok(CONTENTS[start..end].to_vec())
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileInfo> {
        self.lookup(path)
    }

    async fn write(&self, path: &Path, _: &[u8], _: u64, _: WriteFlags) -> VfsResult<u64> {
        Err(self.refuse(path))
    }

    async fn create(&self, _path: &Path) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn mkdir(&self, _path: &Path, _mode: u32) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        Err(self.refuse(path))
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        Err(self.refuse(path))
    }

    async fn rename(&self, from: &Path, _to: &Path) -> VfsResult<()> {
        Err(self.refuse(from))
    }

    async fn chmod(&self, path: &Path, _mode: u32) -> VfsResult<()> {
        Err(self.refuse(path))
    }

    async fn touch(&self, _path: &Path) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    fn read_only(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_greeting() {
        let fs = HelloFs::new();
        let entries = fs.read_dir(Path::new("")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello");

        assert_eq!(fs.read_all(Path::new("hello")).await.unwrap(), CONTENTS);
        assert_eq!(fs.read(Path::new("hello"), 7, 5).await.unwrap(), b"World");
        assert!(fs.read(Path::new("hello"), 100, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only() {
        let fs = HelloFs::new();
        assert!(matches!(
            fs.write(Path::new("hello"), b"x", 0, WriteFlags::empty()).await,
            Err(VfsError::ReadOnly)
        ));
        assert!(matches!(
            fs.remove(Path::new("missing")).await,
            Err(VfsError::NotFound(_))
        ));
        assert!(matches!(fs.create(Path::new("new")).await, Err(VfsError::ReadOnly)));
    }

    #[test]
    fn test_declaration() {
        assert_eq!(MUXFS_PLUGIN_DECLARATION.name, "hellofs");
        assert_eq!(MUXFS_PLUGIN_DECLARATION.abi_version, muxfs::ABI_VERSION);
        assert_eq!(MUXFS_PLUGIN_DECLARATION.muxfs_version, muxfs::VERSION);
    }
}
