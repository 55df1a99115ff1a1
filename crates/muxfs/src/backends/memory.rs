//! In-memory filesystem backend (`memfs`).
//!
//! All data is ephemeral. Instances built for the same mount share one
//! [`MemoryStore`], so whichever pooled instance serves a request sees the
//! same tree.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{VfsError, VfsResult};
use crate::ops::{Capabilities, FileHandle, VfsOps};
use crate::registry::{InstanceFactory, PluginFactory};
use crate::types::{seek_position, FileInfo, MountConfig, OpenFlags, Whence, WriteFlags};

/// Plugin type name.
pub const MEMFS: &str = "memfs";

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Largest file memfs will grow to.
const MAX_FILE_SIZE: u64 = 1 << 30;

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Entry {
    File {
        data: Vec<u8>,
        mode: u32,
        mtime: SystemTime,
    },
    Directory {
        mode: u32,
        mtime: SystemTime,
    },
}

impl Entry {
    fn file(mode: u32) -> Self {
        Entry::File {
            data: Vec::new(),
            mode,
            mtime: SystemTime::now(),
        }
    }

    fn directory(mode: u32) -> Self {
        Entry::Directory {
            mode,
            mtime: SystemTime::now(),
        }
    }

    fn info(&self, path: &Path) -> FileInfo {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self {
            Entry::File { data, mode, mtime } => FileInfo {
                name,
                size: data.len() as u64,
                mode: *mode,
                mod_time: *mtime,
                is_dir: false,
            },
            Entry::Directory { mode, mtime } => FileInfo {
                name,
                size: 0,
                mode: *mode,
                mod_time: *mtime,
                is_dir: true,
            },
        }
    }

    fn set_mode(&mut self, new_mode: u32) {
        match self {
            Entry::File { mode, .. } | Entry::Directory { mode, .. } => *mode = new_mode,
        }
    }

    fn touch(&mut self) {
        match self {
            Entry::File { mtime, .. } | Entry::Directory { mtime, .. } => {
                *mtime = SystemTime::now()
            }
        }
    }
}

/// Tree shared by every instance of one mount.
///
/// Keyed by normalized relative path; the root is the empty path. A
/// `BTreeMap` keeps a directory's descendants contiguous after it.
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<PathBuf, Entry>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        // Root directory always exists
        entries.insert(PathBuf::new(), Entry::directory(DEFAULT_DIR_MODE));
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Normalize a path: remove leading `/`, resolve `.` and `..`.
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(s) => result.push(s),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    result
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

/// Direct and indirect children of `dir`.
fn descendants<'a>(
    entries: &'a BTreeMap<PathBuf, Entry>,
    dir: &'a Path,
) -> impl Iterator<Item = (&'a PathBuf, &'a Entry)> + 'a {
    entries
        .range::<Path, _>((std::ops::Bound::Excluded(dir), std::ops::Bound::Unbounded))
        .take_while(move |(path, _)| path.starts_with(dir))
}

/// Fail unless the parent of `path` is an existing directory.
fn check_parent(entries: &BTreeMap<PathBuf, Entry>, path: &Path) -> VfsResult<()> {
    let parent = path.parent().unwrap_or(Path::new(""));
    match entries.get(parent) {
        Some(Entry::Directory { .. }) => Ok(()),
        Some(Entry::File { .. }) => Err(VfsError::not_a_directory(path_str(parent))),
        None => Err(VfsError::not_found(path_str(parent))),
    }
}

/// End of a write of `len` bytes at `offset`, if it stays within
/// [`MAX_FILE_SIZE`].
fn write_end(path: &Path, offset: u64, len: usize) -> VfsResult<usize> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= MAX_FILE_SIZE => Ok(end as usize),
        _ => Err(VfsError::invalid_argument(format!(
            "write of {len} bytes at offset {offset} exceeds the {MAX_FILE_SIZE} byte limit on {}",
            path_str(path)
        ))),
    }
}

/// Copies `bytes` in at `offset`, zero-filling any gap; returns the end.
fn write_into(path: &Path, data: &mut Vec<u8>, offset: u64, bytes: &[u8]) -> VfsResult<usize> {
    let end = write_end(path, offset, bytes.len())?;
    let start = end - bytes.len();
    if end > data.len() {
        data.resize(end, 0);
    }
    data[start..end].copy_from_slice(bytes);
    Ok(end)
}

/// In-memory filesystem backend.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a backend over a fresh, empty store.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Create a backend over an existing store.
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Plugin factory: one store per mount, shared by its instances.
    pub fn factory() -> impl PluginFactory + 'static {
        |config: &MountConfig| -> VfsResult<Arc<dyn InstanceFactory>> {
            if let Some((key, _)) = config.iter().next() {
                return Err(VfsError::invalid_argument(format!(
                    "memfs takes no configuration, got `{key}`"
                )));
            }
            let store = MemoryStore::new();
            Ok(Arc::new(move || -> VfsResult<Box<dyn VfsOps>> {
                Ok(Box::new(MemoryBackend::with_store(Arc::clone(&store))))
            }))
        }
    }
}

#[async_trait]
impl VfsOps for MemoryBackend {
    async fn read_dir(&self, path: &Path) -> VfsResult<Vec<FileInfo>> {
        let normalized = normalize(path);
        let entries = self.store.entries.read();

        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {}
            Some(Entry::File { .. }) => {
                return Err(VfsError::not_a_directory(path_str(&normalized)));
            }
            None => return Err(VfsError::not_found(path_str(&normalized))),
        }

        // Children come out of the map already ordered by name.
        Ok(descendants(&entries, &normalized)
            .filter(|(child, _)| child.parent() == Some(normalized.as_path()))
            .map(|(child, entry)| entry.info(child))
            .collect())
    }

    async fn read(&self, path: &Path, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        let normalized = normalize(path);
        let entries = self.store.entries.read();

        match entries.get(&normalized) {
            Some(Entry::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(size as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path_str(&normalized))),
            None => Err(VfsError::not_found(path_str(&normalized))),
        }
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileInfo> {
        let normalized = normalize(path);
        self.store
            .entries
            .read()
            .get(&normalized)
            .map(|e| e.info(&normalized))
            .ok_or_else(|| VfsError::not_found(path_str(&normalized)))
    }

    async fn write(
        &self,
        path: &Path,
        data: &[u8],
        offset: u64,
        flags: WriteFlags,
    ) -> VfsResult<u64> {
        let normalized = normalize(path);
        if !flags.contains(WriteFlags::APPEND) {
            write_end(&normalized, offset, data.len())?;
        }
        let mut entries = self.store.entries.write();

        if !entries.contains_key(&normalized) {
            if !flags.contains(WriteFlags::CREATE) {
                return Err(VfsError::not_found(path_str(&normalized)));
            }
            check_parent(&entries, &normalized)?;
            entries.insert(normalized.clone(), Entry::file(DEFAULT_FILE_MODE));
        }

        match entries.get_mut(&normalized) {
            Some(Entry::File {
                data: file_data,
                mtime,
                ..
            }) => {
                if flags.contains(WriteFlags::TRUNCATE) {
                    file_data.clear();
                }
                let offset = if flags.contains(WriteFlags::APPEND) {
                    file_data.len() as u64
                } else {
                    offset
                };
                write_into(&normalized, file_data, offset, data)?;
                *mtime = SystemTime::now();
                Ok(data.len() as u64)
            }
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path_str(&normalized))),
            None => unreachable!("entry inserted above"),
        }
    }

    async fn create(&self, path: &Path) -> VfsResult<()> {
        let normalized = normalize(path);
        let mut entries = self.store.entries.write();

        match entries.get_mut(&normalized) {
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path_str(&normalized))),
            Some(Entry::File { data, mtime, .. }) => {
                data.clear();
                *mtime = SystemTime::now();
                Ok(())
            }
            None => {
                check_parent(&entries, &normalized)?;
                entries.insert(normalized, Entry::file(DEFAULT_FILE_MODE));
                Ok(())
            }
        }
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        let normalized = normalize(path);
        let mut entries = self.store.entries.write();

        if entries.contains_key(&normalized) {
            return Err(VfsError::already_exists(path_str(&normalized)));
        }
        check_parent(&entries, &normalized)?;
        entries.insert(normalized, Entry::directory(mode));
        Ok(())
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        let normalized = normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }

        let mut entries = self.store.entries.write();
        match entries.get(&normalized) {
            Some(Entry::Directory { .. }) => {
                if descendants(&entries, &normalized).next().is_some() {
                    return Err(VfsError::directory_not_empty(path_str(&normalized)));
                }
            }
            Some(Entry::File { .. }) => {}
            None => return Err(VfsError::not_found(path_str(&normalized))),
        }
        entries.remove(&normalized);
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        let normalized = normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }

        let mut entries = self.store.entries.write();
        if !entries.contains_key(&normalized) {
            return Err(VfsError::not_found(path_str(&normalized)));
        }
        let doomed: Vec<PathBuf> = descendants(&entries, &normalized)
            .map(|(child, _)| child.clone())
            .collect();
        for child in doomed {
            entries.remove(&child);
        }
        entries.remove(&normalized);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        let from = normalize(from);
        let to = normalize(to);
        if from.as_os_str().is_empty() || to.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot rename root"));
        }
        if from == to {
            return Ok(());
        }
        if to.starts_with(&from) {
            return Err(VfsError::invalid_argument(format!(
                "cannot move {} into itself",
                path_str(&from)
            )));
        }

        let mut entries = self.store.entries.write();
        let source_is_dir = match entries.get(&from) {
            Some(Entry::Directory { .. }) => true,
            Some(Entry::File { .. }) => false,
            None => return Err(VfsError::not_found(path_str(&from))),
        };
        check_parent(&entries, &to)?;
        match entries.get(&to) {
            Some(Entry::Directory { .. }) if !source_is_dir => {
                return Err(VfsError::is_a_directory(path_str(&to)));
            }
            Some(Entry::Directory { .. }) => {
                if descendants(&entries, &to).next().is_some() {
                    return Err(VfsError::directory_not_empty(path_str(&to)));
                }
            }
            Some(Entry::File { .. }) if source_is_dir => {
                return Err(VfsError::not_a_directory(path_str(&to)));
            }
            _ => {}
        }

        let moved: Vec<PathBuf> = descendants(&entries, &from)
            .map(|(child, _)| child.clone())
            .collect();
        if let Some(entry) = entries.remove(&from) {
            entries.insert(to.clone(), entry);
        }
        for child in moved {
            if let Some(entry) = entries.remove(&child) {
                let relative = child
                    .strip_prefix(&from)
                    .expect("descendant starts with its ancestor");
                entries.insert(to.join(relative), entry);
            }
        }
        Ok(())
    }

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()> {
        let normalized = normalize(path);
        let mut entries = self.store.entries.write();
        let entry = entries
            .get_mut(&normalized)
            .ok_or_else(|| VfsError::not_found(path_str(&normalized)))?;
        entry.set_mode(mode);
        Ok(())
    }

    async fn touch(&self, path: &Path) -> VfsResult<()> {
        let normalized = normalize(path);
        let mut entries = self.store.entries.write();
        if let Some(entry) = entries.get_mut(&normalized) {
            entry.touch();
            return Ok(());
        }
        check_parent(&entries, &normalized)?;
        entries.insert(normalized, Entry::file(DEFAULT_FILE_MODE));
        Ok(())
    }

    async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn FileHandle>> {
        let normalized = normalize(path);
        {
            let mut entries = self.store.entries.write();
            match entries.get_mut(&normalized) {
                Some(Entry::Directory { .. }) => {
                    return Err(VfsError::is_a_directory(path_str(&normalized)));
                }
                Some(Entry::File { .. }) if flags.create && flags.exclusive => {
                    return Err(VfsError::already_exists(path_str(&normalized)));
                }
                Some(Entry::File { data, mtime, .. }) => {
                    if flags.truncate && flags.writable() {
                        data.clear();
                        *mtime = SystemTime::now();
                    }
                }
                None if flags.create => {
                    check_parent(&entries, &normalized)?;
                    entries.insert(normalized.clone(), Entry::file(mode));
                }
                None => return Err(VfsError::not_found(path_str(&normalized))),
            }
        }
        Ok(Box::new(MemoryHandle {
            store: Arc::clone(&self.store),
            path: normalized,
            flags,
            cursor: 0,
        }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::REQUIRED | Capabilities::HANDLES
    }
}

/// Open file in a [`MemoryStore`].
struct MemoryHandle {
    store: Arc<MemoryStore>,
    path: PathBuf,
    flags: OpenFlags,
    cursor: u64,
}

impl MemoryHandle {
    fn read_range(&self, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        if !self.flags.read {
            return Err(VfsError::permission_denied(format!(
                "{} not open for reading",
                path_str(&self.path)
            )));
        }
        match self.store.entries.read().get(&self.path) {
            Some(Entry::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(size as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path_str(&self.path))),
            None => Err(VfsError::not_found(path_str(&self.path))),
        }
    }

    /// Writes at `offset` (or the end in append mode); returns where the
    /// write ended.
    fn write_range(&self, bytes: &[u8], offset: u64) -> VfsResult<u64> {
        if !self.flags.writable() {
            return Err(VfsError::permission_denied(format!(
                "{} not open for writing",
                path_str(&self.path)
            )));
        }
        match self.store.entries.write().get_mut(&self.path) {
            Some(Entry::File { data, mtime, .. }) => {
                let offset = if self.flags.append {
                    data.len() as u64
                } else {
                    offset
                };
                let end = write_into(&self.path, data, offset, bytes)?;
                *mtime = SystemTime::now();
                Ok(end as u64)
            }
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(path_str(&self.path))),
            None => Err(VfsError::not_found(path_str(&self.path))),
        }
    }

    fn len(&self) -> VfsResult<u64> {
        match self.store.entries.read().get(&self.path) {
            Some(entry) => Ok(entry.info(&self.path).size),
            None => Err(VfsError::not_found(path_str(&self.path))),
        }
    }
}

#[async_trait]
impl FileHandle for MemoryHandle {
    async fn read(&mut self, size: u64) -> VfsResult<Vec<u8>> {
        let data = self.read_range(self.cursor, size)?;
        self.cursor += data.len() as u64;
        Ok(data)
    }

    async fn read_at(&mut self, size: u64, offset: u64) -> VfsResult<Vec<u8>> {
        self.read_range(offset, size)
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<u64> {
        self.cursor = self.write_range(data, self.cursor)?;
        Ok(data.len() as u64)
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<u64> {
        self.write_range(data, offset)?;
        Ok(data.len() as u64)
    }

    async fn seek(&mut self, offset: i64, whence: Whence) -> VfsResult<u64> {
        self.cursor = seek_position(self.cursor, self.len()?, offset, whence)?;
        Ok(self.cursor)
    }

    async fn stat(&mut self) -> VfsResult<FileInfo> {
        self.store
            .entries
            .read()
            .get(&self.path)
            .map(|e| e.info(&self.path))
            .ok_or_else(|| VfsError::not_found(path_str(&self.path)))
    }

    async fn close(&mut self) -> VfsResult<()> {
        Ok(())
    }
}
