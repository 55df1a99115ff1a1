//! Open-file handle table.
//!
//! A handle pins the backend instance that opened it: the instance's pool
//! lease lives inside the handle until close, so the instance is never lent
//! to anyone else and the mount cannot drain underneath it.
//!
//! The map lock only covers insert/lookup/remove. Backend I/O runs under the
//! handle's own async mutex, so operations on one handle are serialized
//! while different handles proceed in parallel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{VfsError, VfsResult};
use crate::ops::FileHandle;
use crate::pool::PooledInstance;
use crate::types::{FileInfo, OpenFlags, Whence};

/// Process-unique handle id. Ids start at 1 and are never reused.
pub type HandleId = u64;

/// Diagnostic description of an open handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub id: HandleId,
    /// Absolute path the handle was opened with.
    pub path: String,
    /// Mount the handle is bound to.
    pub mount: String,
    pub flags: OpenFlags,
}

struct HandleState {
    file: Box<dyn FileHandle>,
    // Dropped after the backend close so the instance returns to its pool
    // only once the handle is finished with it.
    lease: Option<PooledInstance>,
    closed: bool,
}

struct HandleEntry {
    info: HandleInfo,
    state: Arc<Mutex<HandleState>>,
}

/// Table of open handles.
pub struct HandleTable {
    entries: DashMap<HandleId, Arc<HandleEntry>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("open", &self.entries.len())
            .finish()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an open file and the lease it is bound to.
    pub fn insert(
        &self,
        path: impl Into<String>,
        flags: OpenFlags,
        file: Box<dyn FileHandle>,
        lease: PooledInstance,
    ) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = HandleInfo {
            id,
            path: path.into(),
            mount: lease.mount().to_string(),
            flags,
        };
        info!(handle = id, path = %info.path, mount = %info.mount, "Opened handle");
        self.entries.insert(
            id,
            Arc::new(HandleEntry {
                info,
                state: Arc::new(Mutex::new(HandleState {
                    file,
                    lease: Some(lease),
                    closed: false,
                })),
            }),
        );
        id
    }

    fn entry(&self, id: HandleId) -> VfsResult<Arc<HandleEntry>> {
        self.entries
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(VfsError::UnknownHandle(id))
    }

    /// Lock an open handle for one operation.
    async fn lock(
        &self,
        id: HandleId,
    ) -> VfsResult<(Arc<HandleEntry>, OwnedMutexGuard<HandleState>)> {
        let entry = self.entry(id)?;
        let state = Arc::clone(&entry.state).lock_owned().await;
        // Lost a race with close.
        if state.closed {
            return Err(VfsError::UnknownHandle(id));
        }
        Ok((entry, state))
    }

    /// Read up to `size` bytes; at `offset` if given, else at the cursor.
    pub async fn read(&self, id: HandleId, size: u64, offset: Option<u64>) -> VfsResult<Vec<u8>> {
        let (entry, mut state) = self.lock(id).await?;
        let result = match offset {
            Some(offset) => state.file.read_at(size, offset).await,
            None => state.file.read(size).await,
        };
        result.map_err(|e| e.in_mount(&entry.info.mount, "read"))
    }

    /// Write `data`; at `offset` if given, else at the cursor.
    pub async fn write(&self, id: HandleId, data: &[u8], offset: Option<u64>) -> VfsResult<u64> {
        let (entry, mut state) = self.lock(id).await?;
        let result = match offset {
            Some(offset) => state.file.write_at(data, offset).await,
            None => state.file.write(data).await,
        };
        result.map_err(|e| e.in_mount(&entry.info.mount, "write"))
    }

    pub async fn seek(&self, id: HandleId, offset: i64, whence: Whence) -> VfsResult<u64> {
        let (entry, mut state) = self.lock(id).await?;
        state
            .file
            .seek(offset, whence)
            .await
            .map_err(|e| e.in_mount(&entry.info.mount, "seek"))
    }

    pub async fn sync(&self, id: HandleId) -> VfsResult<()> {
        let (entry, mut state) = self.lock(id).await?;
        state
            .file
            .sync()
            .await
            .map_err(|e| e.in_mount(&entry.info.mount, "sync"))
    }

    pub async fn stat(&self, id: HandleId) -> VfsResult<FileInfo> {
        let (entry, mut state) = self.lock(id).await?;
        state
            .file
            .stat()
            .await
            .map_err(|e| e.in_mount(&entry.info.mount, "stat"))
    }

    /// Close a handle.
    ///
    /// The entry is removed and the instance released even when the backend
    /// close fails; that failure is still returned.
    pub async fn close(&self, id: HandleId) -> VfsResult<()> {
        let (_, entry) = self
            .entries
            .remove(&id)
            .ok_or(VfsError::UnknownHandle(id))?;
        let mut state = entry.state.lock().await;
        state.closed = true;
        let result = state.file.close().await;
        drop(state.lease.take());

        match &result {
            Ok(()) => info!(handle = id, path = %entry.info.path, "Closed handle"),
            Err(e) => warn!(handle = id, path = %entry.info.path, error = %e, "Handle close failed"),
        }
        result.map_err(|e| e.in_mount(&entry.info.mount, "close"))
    }

    /// Close every open handle, returning how many closed cleanly.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<HandleId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            if self.close(id).await.is_ok() {
                closed += 1;
            }
        }
        debug!(closed, "Closed all handles");
        closed
    }

    /// Describe one handle.
    pub fn info(&self, id: HandleId) -> VfsResult<HandleInfo> {
        Ok(self.entry(id)?.info.clone())
    }

    /// Snapshot of open handles, ordered by id.
    pub fn list(&self) -> Vec<HandleInfo> {
        let mut all: Vec<HandleInfo> = self
            .entries
            .iter()
            .map(|e| e.value().info.clone())
            .collect();
        all.sort_by_key(|info| info.id);
        all
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
