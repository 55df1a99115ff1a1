//! Local filesystem backend (`localfs`).
//!
//! Exposes a host directory, with path security to prevent escaping it.
//!
//! Mount configuration:
//!
//! | key         | type   | required | meaning                         |
//! |-------------|--------|----------|---------------------------------|
//! | `local_dir` | string | yes      | existing host directory to serve |
//! | `read_only` | bool   | no       | refuse every mutation            |

use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{VfsError, VfsResult};
use crate::ops::{Capabilities, FileHandle, VfsOps};
use crate::registry::{InstanceFactory, PluginFactory};
use crate::types::{seek_position, FileInfo, MountConfig, OpenFlags, Whence, WriteFlags};

/// Plugin type name.
pub const LOCALFS: &str = "localfs";

const DEFAULT_FILE_MODE: u32 = 0o644;

/// Map an I/O failure on `path` to the matching classified error.
fn io_error(path: &Path, e: io::Error) -> VfsError {
    let shown = path.display().to_string();
    match e.kind() {
        io::ErrorKind::NotFound => VfsError::not_found(shown),
        io::ErrorKind::AlreadyExists => VfsError::already_exists(shown),
        io::ErrorKind::PermissionDenied => VfsError::permission_denied(shown),
        io::ErrorKind::NotADirectory => VfsError::not_a_directory(shown),
        io::ErrorKind::IsADirectory => VfsError::is_a_directory(shown),
        io::ErrorKind::DirectoryNotEmpty => VfsError::directory_not_empty(shown),
        _ => VfsError::Io(e),
    }
}

fn metadata_to_info(name: String, meta: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        name,
        size: if meta.is_dir() { 0 } else { meta.len() },
        mode: meta.permissions().mode() & 0o7777,
        mod_time: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        is_dir: meta.is_dir(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Local filesystem backend.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/srv/data`, then `read("logs/today.txt")` reads
/// `/srv/data/logs/today.txt`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    read_only: bool,
}

impl LocalBackend {
    /// Create a backend rooted at an existing directory.
    ///
    /// The root is canonicalized so symlinked roots (e.g. macOS `/tmp`)
    /// compare correctly against resolved paths.
    pub fn new(root: impl Into<PathBuf>) -> VfsResult<Self> {
        let root: PathBuf = root.into();
        let canonical = root
            .canonicalize()
            .map_err(|e| VfsError::invalid_argument(format!("{}: {e}", root.display())))?;
        if !canonical.is_dir() {
            return Err(VfsError::invalid_argument(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root: canonical,
            read_only: false,
        })
    }

    /// Create a read-only backend.
    pub fn new_read_only(root: impl Into<PathBuf>) -> VfsResult<Self> {
        Ok(Self {
            read_only: true,
            ..Self::new(root)?
        })
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Plugin factory reading `local_dir` and `read_only` from the mount
    /// configuration.
    pub fn factory() -> impl PluginFactory + 'static {
        |config: &MountConfig| -> VfsResult<Arc<dyn InstanceFactory>> {
            for (key, _) in config.iter() {
                if key != "local_dir" && key != "read_only" {
                    return Err(VfsError::invalid_argument(format!(
                        "unknown localfs option `{key}`"
                    )));
                }
            }
            let local_dir = config
                .get_str("local_dir")
                .ok_or_else(|| VfsError::invalid_argument("localfs requires `local_dir`"))?;
            let read_only = match config.get("read_only") {
                None => false,
                Some(_) => config
                    .get_bool("read_only")
                    .ok_or_else(|| VfsError::invalid_argument("`read_only` must be a boolean"))?,
            };

            let template = if read_only {
                LocalBackend::new_read_only(local_dir)?
            } else {
                LocalBackend::new(local_dir)?
            };
            Ok(Arc::new(move || -> VfsResult<Box<dyn VfsOps>> {
                Ok(Box::new(template.clone()))
            }))
        }
    }

    /// Resolve a relative path to an absolute path within the root.
    ///
    /// Returns an error if the path escapes the root (via `..` or a
    /// symlink).
    fn resolve(&self, path: &Path) -> VfsResult<PathBuf> {
        let path = path.strip_prefix("/").unwrap_or(path);
        if path.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }

        let full = self.root.join(path);

        // Canonicalize existing paths; for new ones canonicalize the parent
        // and append the file name.
        let canonical = if full.exists() {
            full.canonicalize().map_err(|e| io_error(path, e))?
        } else {
            let parent = full
                .parent()
                .ok_or_else(|| VfsError::invalid_argument("no parent"))?;
            let filename = full
                .file_name()
                .ok_or_else(|| VfsError::invalid_argument("no filename"))?;
            if parent.exists() {
                parent
                    .canonicalize()
                    .map_err(|e| io_error(path, e))?
                    .join(filename)
            } else {
                // Parent doesn't exist, the operation itself reports it
                full
            }
        };

        if !canonical.starts_with(&self.root) {
            return Err(VfsError::PathEscapesRoot(path.display().to_string()));
        }
        Ok(canonical)
    }

    fn check_writable(&self) -> VfsResult<()> {
        if self.read_only {
            Err(VfsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn check_not_root(&self, full: &Path, what: &str) -> VfsResult<()> {
        if full == self.root {
            return Err(VfsError::permission_denied(format!("cannot {what} root")));
        }
        Ok(())
    }
}

#[async_trait]
impl VfsOps for LocalBackend {
    async fn read_dir(&self, path: &Path) -> VfsResult<Vec<FileInfo>> {
        let full_path = self.resolve(path)?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(path, e))? {
            let meta = entry.metadata().await.map_err(|e| io_error(path, e))?;
            entries.push(metadata_to_info(
                entry.file_name().to_string_lossy().into_owned(),
                &meta,
            ));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &Path, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        let full_path = self.resolve(path)?;
        let mut file = fs::File::open(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_error(path, e))?;

        let mut buffer = Vec::new();
        (&mut file)
            .take(size)
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(buffer)
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileInfo> {
        let full_path = self.resolve(path)?;
        let meta = fs::metadata(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(metadata_to_info(file_name(path), &meta))
    }

    async fn write(
        &self,
        path: &Path,
        data: &[u8],
        offset: u64,
        flags: WriteFlags,
    ) -> VfsResult<u64> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(flags.contains(WriteFlags::CREATE))
            .truncate(flags.contains(WriteFlags::TRUNCATE))
            .append(flags.contains(WriteFlags::APPEND))
            .mode(DEFAULT_FILE_MODE)
            .open(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        if !flags.contains(WriteFlags::APPEND) {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| io_error(path, e))?;
        }
        file.write_all(data).await.map_err(|e| io_error(path, e))?;
        file.flush().await.map_err(|e| io_error(path, e))?;

        Ok(data.len() as u64)
    }

    async fn create(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;

        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(DEFAULT_FILE_MODE)
            .open(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(())
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;

        fs::DirBuilder::new()
            .mode(mode)
            .create(&full_path)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        self.check_not_root(&full_path, "remove")?;

        let meta = fs::symlink_metadata(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;
        let removed = if meta.is_dir() {
            fs::remove_dir(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        removed.map_err(|e| io_error(path, e))
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        self.check_not_root(&full_path, "remove")?;

        let meta = fs::symlink_metadata(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        removed.map_err(|e| io_error(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        self.check_not_root(&from_path, "rename")?;
        self.check_not_root(&to_path, "rename")?;

        fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| io_error(from, e))
    }

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;

        fs::set_permissions(&full_path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn touch(&self, path: &Path) -> VfsResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;

        if !full_path.exists() {
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .mode(DEFAULT_FILE_MODE)
                .open(&full_path)
                .await
                .map_err(|e| io_error(path, e))?;
            return Ok(());
        }

        let file = fs::File::open(&full_path)
            .await
            .map_err(|e| io_error(path, e))?
            .into_std()
            .await;
        file.set_modified(SystemTime::now())
            .map_err(|e| io_error(path, e))
    }

    async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn FileHandle>> {
        if flags.writable() || flags.create || flags.truncate {
            self.check_writable()?;
        }
        let full_path = self.resolve(path)?;
        if full_path.is_dir() {
            return Err(VfsError::is_a_directory(path.display().to_string()));
        }

        let file = fs::OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .append(flags.append)
            .create(flags.create && !flags.exclusive)
            .create_new(flags.create && flags.exclusive)
            .truncate(flags.truncate)
            .mode(mode)
            .open(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        Ok(Box::new(LocalHandle {
            file,
            path: path.to_path_buf(),
            cursor: 0,
        }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::REQUIRED | Capabilities::HANDLES
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// Open host file.
///
/// The OS cursor is repositioned before every operation so positioned
/// reads and writes never disturb the logical cursor.
struct LocalHandle {
    file: fs::File,
    path: PathBuf,
    cursor: u64,
}

impl LocalHandle {
    fn err(&self, e: io::Error) -> VfsError {
        io_error(&self.path, e)
    }

    async fn read_from(&mut self, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| self.err(e))?;
        let mut buffer = Vec::new();
        (&mut self.file)
            .take(size)
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        Ok(buffer)
    }

    /// Returns the OS position after the write.
    async fn write_from(&mut self, offset: u64, data: &[u8]) -> VfsResult<u64> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| self.err(e))?;
        self.file.write_all(data).await.map_err(|e| self.err(e))?;
        self.file.flush().await.map_err(|e| self.err(e))?;
        self.file.stream_position().await.map_err(|e| self.err(e))
    }
}

#[async_trait]
impl FileHandle for LocalHandle {
    async fn read(&mut self, size: u64) -> VfsResult<Vec<u8>> {
        let data = self.read_from(self.cursor, size).await?;
        self.cursor += data.len() as u64;
        Ok(data)
    }

    async fn read_at(&mut self, size: u64, offset: u64) -> VfsResult<Vec<u8>> {
        self.read_from(offset, size).await
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<u64> {
        self.cursor = self.write_from(self.cursor, data).await?;
        Ok(data.len() as u64)
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<u64> {
        self.write_from(offset, data).await?;
        Ok(data.len() as u64)
    }

    async fn seek(&mut self, offset: i64, whence: Whence) -> VfsResult<u64> {
        let len = self.file.metadata().await.map_err(|e| self.err(e))?.len();
        self.cursor = seek_position(self.cursor, len, offset, whence)?;
        Ok(self.cursor)
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.file.sync_all().await.map_err(|e| self.err(e))
    }

    async fn stat(&mut self) -> VfsResult<FileInfo> {
        let meta = self.file.metadata().await.map_err(|e| self.err(e))?;
        Ok(metadata_to_info(file_name(&self.path), &meta))
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.file.flush().await.map_err(|e| self.err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let (_dir, fs) = setup();

        fs.create(Path::new("test.txt")).await.unwrap();
        fs.write(Path::new("test.txt"), b"hello world", 0, WriteFlags::empty())
            .await
            .unwrap();

        let data = fs.read(Path::new("test.txt"), 0, 100).await.unwrap();
        assert_eq!(data, b"hello world");

        let data = fs.read(Path::new("test.txt"), 6, 5).await.unwrap();
        assert_eq!(data, b"world");

        let data = fs.read(Path::new("test.txt"), 50, 5).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_write_flags() {
        let (dir, fs) = setup();

        let missing = fs
            .write(Path::new("new.txt"), b"x", 0, WriteFlags::empty())
            .await;
        assert!(matches!(missing, Err(VfsError::NotFound(_))));

        fs.write(Path::new("new.txt"), b"abc", 0, WriteFlags::CREATE)
            .await
            .unwrap();
        fs.write(Path::new("new.txt"), b"def", 0, WriteFlags::APPEND)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"abcdef");

        fs.write(Path::new("new.txt"), b"z", 0, WriteFlags::TRUNCATE)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"z");
    }

    #[tokio::test]
    async fn test_mkdir_and_read_dir() {
        let (_dir, fs) = setup();

        fs.mkdir(Path::new("subdir"), 0o755).await.unwrap();
        fs.create(Path::new("subdir/file.txt")).await.unwrap();
        fs.create(Path::new("root.txt")).await.unwrap();

        let entries = fs.read_dir(Path::new("")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root.txt", "subdir"]);
        assert!(entries[1].is_dir);

        let sub = fs.read_dir(Path::new("subdir")).await.unwrap();
        assert_eq!(sub.len(), 1);
        assert_eq!(sub[0].name, "file.txt");
    }

    #[tokio::test]
    async fn test_mkdir_errors() {
        let (_dir, fs) = setup();
        fs.mkdir(Path::new("d"), 0o755).await.unwrap();

        let again = fs.mkdir(Path::new("d"), 0o755).await;
        assert!(matches!(again, Err(VfsError::AlreadyExists(_))));

        let orphan = fs.mkdir(Path::new("x/y"), 0o755).await;
        assert!(matches!(orphan, Err(VfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_and_remove_all() {
        let (dir, fs) = setup();
        fs.mkdir(Path::new("tree"), 0o755).await.unwrap();
        fs.create(Path::new("tree/leaf")).await.unwrap();

        let err = fs.remove(Path::new("tree")).await;
        assert!(matches!(err, Err(VfsError::DirectoryNotEmpty(_))));

        fs.remove_all(Path::new("tree")).await.unwrap();
        assert!(!dir.path().join("tree").exists());

        let missing = fs.remove_all(Path::new("tree")).await;
        assert!(matches!(missing, Err(VfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rename_and_chmod() {
        let (dir, fs) = setup();
        fs.create(Path::new("old.txt")).await.unwrap();
        fs.rename(Path::new("old.txt"), Path::new("new.txt"))
            .await
            .unwrap();
        assert!(!dir.path().join("old.txt").exists());

        fs.chmod(Path::new("new.txt"), 0o600).await.unwrap();
        let info = fs.stat(Path::new("new.txt")).await.unwrap();
        assert_eq!(info.mode, 0o600);
        assert_eq!(info.name, "new.txt");
    }

    #[tokio::test]
    async fn test_touch() {
        let (dir, fs) = setup();
        fs.touch(Path::new("t")).await.unwrap();
        assert!(dir.path().join("t").exists());

        std::fs::write(dir.path().join("t"), b"keep").unwrap();
        fs.touch(Path::new("t")).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("t")).unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_read_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("existing.txt"), b"data").unwrap();

        let fs = LocalBackend::new_read_only(dir.path()).unwrap();
        assert!(fs.read_only());

        let data = fs.read(Path::new("existing.txt"), 0, 100).await.unwrap();
        assert_eq!(data, b"data");

        let result = fs.create(Path::new("new.txt")).await;
        assert!(matches!(result, Err(VfsError::ReadOnly)));

        let result = fs
            .open(Path::new("existing.txt"), OpenFlags::write(), 0)
            .await;
        assert!(matches!(result, Err(VfsError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let (_dir, fs) = setup();
        let result = fs.read(Path::new("../../../etc/passwd"), 0, 100).await;
        assert!(matches!(result, Err(VfsError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_symlink_escape_blocked() {
        let (dir, fs) = setup();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let result = fs.read(Path::new("link/secret"), 0, 10).await;
        assert!(matches!(result, Err(VfsError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_factory_config() {
        let dir = TempDir::new().unwrap();
        let factory = LocalBackend::factory();

        assert!(factory.configure(&MountConfig::new()).is_err());
        assert!(factory
            .configure(&MountConfig::new().with("local_dir", "/definitely/not/here"))
            .is_err());
        assert!(factory
            .configure(
                &MountConfig::new()
                    .with("local_dir", dir.path().to_string_lossy().into_owned())
                    .with("colour", "blue")
            )
            .is_err());

        let instances = factory
            .configure(
                &MountConfig::new()
                    .with("local_dir", dir.path().to_string_lossy().into_owned())
                    .with("read_only", true),
            )
            .unwrap();
        let instance = instances.create().unwrap();
        assert!(instance.read_only());
    }

    #[tokio::test]
    async fn test_handle_io() {
        let (dir, fs) = setup();
        let mut handle = fs
            .open(Path::new("h.txt"), OpenFlags::create(), 0o600)
            .await
            .unwrap();

        handle.write(b"hello ").await.unwrap();
        handle.write(b"world").await.unwrap();
        assert_eq!(handle.read_at(5, 0).await.unwrap(), b"hello");
        assert!(handle.read(10).await.unwrap().is_empty());

        assert_eq!(handle.seek(0, Whence::Start).await.unwrap(), 0);
        assert_eq!(handle.read(5).await.unwrap(), b"hello");
        assert_eq!(handle.read(100).await.unwrap(), b" world");

        handle.sync().await.unwrap();
        let info = handle.stat().await.unwrap();
        assert_eq!(info.size, 11);
        handle.close().await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("h.txt")).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_handle_exclusive_create() {
        let (dir, fs) = setup();
        std::fs::write(dir.path().join("x"), b"1").unwrap();
        let result = fs
            .open(Path::new("x"), OpenFlags::create_exclusive(), 0o644)
            .await;
        assert!(matches!(result, Err(VfsError::AlreadyExists(_))));
    }
}
