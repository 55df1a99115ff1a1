//! The multiplexed filesystem.
//!
//! [`MountableFs`] ties the registry, mount table, instance pools, handle
//! table and plugin loader together behind one path- and handle-based API.
//! It is an ordinary value: create as many as you like.
//!
//! ```text
//! path op ──► normalize ──► MountTable::resolve ──► pool.acquire ──► backend
//!                                                      (lease dropped after)
//! open ──► ... ──► backend.open ──► HandleTable (lease held until close)
//! handle op ──► HandleTable ──► FileHandle
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backends::{LocalBackend, MemoryBackend, LOCALFS, MEMFS};
use crate::config::{ConfigError, MuxConfig};
use crate::error::{ErrorKind, VfsError, VfsResult};
use crate::handle::{HandleId, HandleInfo, HandleTable};
use crate::loader::{PluginDeclaration, PluginLoader};
use crate::mount::{normalize_path, Mount, MountTable};
use crate::pool::{DrainPolicy, InstancePool, PoolConfig, PoolStats, PooledInstance};
use crate::registry::{PluginFactory, PluginRegistry};
use crate::types::{FileInfo, ModuleInfo, MountConfig, MountInfo, OpenFlags, Whence, WriteFlags};

const SYNTHETIC_DIR_MODE: u32 = 0o755;

/// Version and optional features of this build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsCapabilities {
    pub version: String,
    pub features: Vec<String>,
}

/// Liveness report. Getting one at all means the filesystem is answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsHealth {
    pub mounts: usize,
    pub open_handles: usize,
    pub loaded_plugins: usize,
}

/// A backend instance leased for one path operation.
struct Target {
    // Returned to the pool before the mount reference goes away.
    instance: PooledInstance,
    mount: Arc<Mount>,
    residual: PathBuf,
}

impl Target {
    fn context(&self, op: &'static str) -> impl Fn(VfsError) -> VfsError + '_ {
        move |e| e.in_mount(self.mount.path(), op)
    }
}

/// Mount paths with a mount or unmount in progress.
///
/// The lock is only held to check and record a claim; the slow part of
/// mounting or unmounting runs with the claim held but the lock released.
#[derive(Default)]
struct InFlight(Mutex<HashSet<String>>);

impl InFlight {
    /// Claim `path` if nothing else holds it and `check` passes; `check`
    /// runs under the lock.
    fn claim(
        &self,
        path: &str,
        check: impl FnOnce() -> VfsResult<()>,
    ) -> VfsResult<Claim<'_>> {
        let mut paths = self.0.lock();
        if paths.contains(path) {
            return Err(VfsError::Busy(format!(
                "{path} is being mounted or unmounted"
            )));
        }
        check()?;
        paths.insert(path.to_string());
        Ok(Claim {
            set: self,
            path: path.to_string(),
        })
    }
}

struct Claim<'a> {
    set: &'a InFlight,
    path: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.0.lock().remove(&self.path);
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Mountable virtual filesystem.
pub struct MountableFs {
    registry: Arc<PluginRegistry>,
    mounts: Arc<MountTable>,
    handles: HandleTable,
    loader: PluginLoader,
    pool_config: PoolConfig,
    drain_policy: DrainPolicy,
    in_flight: InFlight,
}

impl std::fmt::Debug for MountableFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountableFs")
            .field("mounts", &self.mounts)
            .field("handles", &self.handles)
            .field("plugins", &self.registry.names())
            .finish()
    }
}

impl Default for MountableFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MountableFs {
    /// Create a filesystem with no mounts and the built-in plugin types
    /// (`memfs`, `localfs`) registered.
    pub fn new() -> Self {
        let registry = Arc::new(PluginRegistry::new());
        let mounts = Arc::new(MountTable::new());
        let loader = PluginLoader::new(Arc::clone(&registry), Arc::clone(&mounts));

        let fs = Self {
            registry,
            mounts,
            handles: HandleTable::new(),
            loader,
            pool_config: PoolConfig::default(),
            drain_policy: DrainPolicy::default(),
            in_flight: InFlight::default(),
        };
        fs.registry
            .register_builtin(MEMFS, MemoryBackend::factory())
            .and_then(|()| {
                fs.registry
                    .register_builtin(LOCALFS, LocalBackend::factory())
            })
            .expect("built-in plugin names are distinct");
        fs
    }

    /// Pool settings for mounts created without explicit ones.
    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// What unmount does while instances are lent out.
    pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    /// Build a filesystem from configuration: load plugins, then mount.
    pub async fn from_config(config: &MuxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let fs = Self::new()
            .with_pool_config(config.pool_config())
            .with_drain_policy(config.drain_policy());

        for module in &config.plugins.load {
            fs.load_plugin(module).await?;
        }
        for mount in &config.mounts {
            fs.mount_with(
                &mount.path,
                &mount.plugin,
                mount.config.clone(),
                config.pool_config_for(mount),
            )
            .await?;
        }
        info!(
            mounts = config.mounts.len(),
            plugins = config.plugins.load.len(),
            "Filesystem configured"
        );
        Ok(fs)
    }

    // ========================================================================
    // Plugins
    // ========================================================================

    /// Register an in-process plugin type.
    pub fn register_plugin(
        &self,
        name: impl Into<String>,
        factory: impl PluginFactory + 'static,
    ) -> VfsResult<()> {
        self.registry.register_builtin(name, factory)
    }

    /// Load a plugin module; returns the registered type name.
    pub async fn load_plugin(&self, path: impl AsRef<Path>) -> VfsResult<String> {
        self.loader.load(path).await
    }

    /// Register a statically linked plugin declaration through the loader.
    pub async fn load_static_plugin(
        &self,
        declaration: &'static PluginDeclaration,
        origin: impl Into<PathBuf>,
    ) -> VfsResult<String> {
        self.loader.load_static(declaration, origin).await
    }

    /// Unload a plugin module. Fails with `InUse` while it is mounted.
    pub fn unload_plugin(&self, path: impl AsRef<Path>) -> VfsResult<()> {
        self.loader.unload(path)
    }

    /// Loaded plugin modules.
    pub fn list_plugins(&self) -> Vec<ModuleInfo> {
        self.loader.list_loaded()
    }

    /// All registered plugin type names, built-in and loaded.
    pub fn plugin_types(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Version and optional feature report.
    pub fn capabilities(&self) -> FsCapabilities {
        FsCapabilities {
            version: crate::VERSION.to_string(),
            features: ["handlefs", "touch", "plugins"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn health(&self) -> FsHealth {
        FsHealth {
            mounts: self.mounts.list().len(),
            open_handles: self.handles.len(),
            loaded_plugins: self.loader.list_loaded().len(),
        }
    }

    // ========================================================================
    // Mounts
    // ========================================================================

    /// Mount a plugin type at `path` with the default pool settings.
    pub async fn mount(&self, path: &str, plugin: &str, config: MountConfig) -> VfsResult<()> {
        self.mount_with(path, plugin, config, self.pool_config).await
    }

    /// Mount with explicit pool settings.
    ///
    /// One instance is built before the mount becomes visible, so a
    /// configuration the plugin cannot work with is reported here.
    pub async fn mount_with(
        &self,
        path: &str,
        plugin: &str,
        config: MountConfig,
        pool_config: PoolConfig,
    ) -> VfsResult<()> {
        let path = normalize_path(path)?;
        let _claim = self.in_flight.claim(&path, || {
            if self.mounts.contains(&path) {
                return Err(VfsError::invalid_argument(format!("already mounted: {path}")));
            }
            Ok(())
        })?;

        let registration = self.registry.get(plugin)?;
        let factory = registration.configure(&config)?;
        let pool = InstancePool::new(path.clone(), registration.name(), factory, pool_config)?;
        pool.prime()?;

        let mount = self.mounts.insert(Mount::new(
            path.clone(),
            Arc::clone(&registration),
            config,
            pool,
        ))?;

        // The type may have been unloaded while we were configuring.
        if !self.registry.is_current(&registration) {
            self.mounts.remove(&mount);
            if let Err(e) = mount.pool().drain(DrainPolicy::Fail).await {
                warn!(path = %path, error = %e, "Failed to drain rolled-back mount");
            }
            return Err(VfsError::UnknownPluginType(plugin.to_string()));
        }

        info!(
            path = %path,
            plugin = %plugin,
            max_instances = pool_config.max_instances,
            "Mounted"
        );
        Ok(())
    }

    /// Unmount using the configured drain policy.
    pub async fn unmount(&self, path: &str) -> VfsResult<()> {
        self.unmount_with(path, self.drain_policy).await
    }

    /// Unmount, choosing what to do about instances still lent out.
    ///
    /// New resolutions stop reaching the mount as soon as it is quiesced;
    /// anything already waiting on its pool gets `NotMounted`. While the
    /// drain waits, other paths can be mounted and unmounted; a second
    /// unmount of the same path gets `Busy`.
    pub async fn unmount_with(&self, path: &str, policy: DrainPolicy) -> VfsResult<()> {
        let path = normalize_path(path)?;
        let mut found = None;
        let _claim = self.in_flight.claim(&path, || match self.mounts.get(&path) {
            Some(mount) => {
                found = Some(mount);
                Ok(())
            }
            None => Err(VfsError::NotMounted(path.clone())),
        })?;
        let Some(mount) = found else {
            return Err(VfsError::NotMounted(path));
        };

        let drain = mount.pool().quiesce(policy).await.inspect_err(|e| {
            debug!(path = %path, error = %e, "Unmount refused");
        })?;
        self.mounts.remove(&mount);
        drain.finish().await;

        info!(path = %path, plugin = %mount.plugin().name(), "Unmounted");
        Ok(())
    }

    /// Mounts ordered by path.
    pub fn list_mounts(&self) -> Vec<MountInfo> {
        self.mounts.list()
    }

    /// Pool bookkeeping for the mount at exactly `path`.
    pub fn pool_stats(&self, path: &str) -> VfsResult<PoolStats> {
        let path = normalize_path(path)?;
        self.mounts
            .get(&path)
            .map(|m| m.pool().stats())
            .ok_or(VfsError::NotMounted(path))
    }

    /// Shut down idle instances past their idle timeout on every mount.
    pub async fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        for mount in self.mounts.mounts() {
            evicted += mount.pool().evict_idle().await;
        }
        evicted
    }

    /// Close every handle and unmount everything, waiting for in-flight
    /// operations to finish.
    pub async fn shutdown(&self) {
        let closed = self.handles.close_all().await;
        let mounts = self.mounts.mounts();
        for mount in mounts.iter().rev() {
            let _claim = match self.in_flight.claim(mount.path(), || Ok(())) {
                Ok(claim) => claim,
                Err(e) => {
                    warn!(path = %mount.path(), error = %e, "Skipping mount during shutdown");
                    continue;
                }
            };
            match mount.pool().quiesce(DrainPolicy::Wait { timeout: None }).await {
                Ok(drain) => {
                    self.mounts.remove(mount);
                    drain.finish().await;
                }
                Err(e) => warn!(path = %mount.path(), error = %e, "Failed to drain mount"),
            }
        }
        info!(handles = closed, mounts = mounts.len(), "Filesystem shut down");
    }

    // ========================================================================
    // Routing
    // ========================================================================

    async fn target(&self, path: &str) -> VfsResult<Target> {
        let path = normalize_path(path)?;
        let resolved = self.mounts.resolve(&path)?;
        let instance = resolved.mount.pool().acquire().await?;
        Ok(Target {
            instance,
            mount: resolved.mount,
            residual: resolved.residual,
        })
    }

    // ========================================================================
    // Path operations
    // ========================================================================

    /// List a directory, including mount points directly below it.
    pub async fn read_dir(&self, path: &str) -> VfsResult<Vec<FileInfo>> {
        let normalized = normalize_path(path)?;
        let synthetic = self.mounts.child_names(&normalized);

        let listed = match self.target(&normalized).await {
            Ok(target) => target
                .instance
                .read_dir(&target.residual)
                .await
                .map_err(target.context("read_dir")),
            Err(e) => Err(e),
        };
        let mut entries = match listed {
            Ok(entries) => entries,
            Err(e) if synthetic.is_empty() || e.kind() != ErrorKind::NotFound => {
                return Err(e);
            }
            Err(_) => Vec::new(),
        };

        if !synthetic.is_empty() {
            entries.retain(|e| !synthetic.contains(&e.name));
            for name in synthetic {
                let child = if normalized == "/" {
                    format!("/{name}")
                } else {
                    format!("{normalized}/{name}")
                };
                entries.push(self.stat(&child).await.unwrap_or_else(|_| {
                    FileInfo::directory(name, SYNTHETIC_DIR_MODE)
                }));
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Ok(entries)
    }

    /// Metadata for a path. Mount points and their ancestors always report
    /// as directories.
    pub async fn stat(&self, path: &str) -> VfsResult<FileInfo> {
        let normalized = normalize_path(path)?;
        let name = last_segment(&normalized).to_string();

        let result = match self.target(&normalized).await {
            Ok(target) => target
                .instance
                .stat(&target.residual)
                .await
                .map_err(target.context("stat")),
            Err(e) => Err(e),
        };
        match result {
            Ok(info) => Ok(info.with_name(name)),
            Err(e) if e.kind() == ErrorKind::NotFound && self.mounts.covers(&normalized) => {
                Ok(FileInfo::directory(name, SYNTHETIC_DIR_MODE))
            }
            Err(e) => Err(e),
        }
    }

    /// Read up to `size` bytes at `offset`. Short or empty at end of file.
    pub async fn read(&self, path: &str, offset: u64, size: u64) -> VfsResult<Vec<u8>> {
        let target = self.target(path).await?;
        target
            .instance
            .read(&target.residual, offset, size)
            .await
            .map_err(target.context("read"))
    }

    /// Write `data` at `offset`; returns the number of bytes written.
    pub async fn write(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        flags: WriteFlags,
    ) -> VfsResult<u64> {
        let target = self.target(path).await?;
        target
            .instance
            .write(&target.residual, data, offset, flags)
            .await
            .map_err(target.context("write"))
    }

    /// Create an empty file, truncating an existing one.
    pub async fn create(&self, path: &str) -> VfsResult<()> {
        let target = self.target(path).await?;
        target
            .instance
            .create(&target.residual)
            .await
            .map_err(target.context("create"))
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let target = self.target(path).await?;
        target
            .instance
            .mkdir(&target.residual, mode)
            .await
            .map_err(target.context("mkdir"))
    }

    /// Remove a file or an empty directory.
    pub async fn remove(&self, path: &str) -> VfsResult<()> {
        let target = self.target(path).await?;
        target
            .instance
            .remove(&target.residual)
            .await
            .map_err(target.context("remove"))
    }

    /// Remove a file or a whole directory tree.
    pub async fn remove_all(&self, path: &str) -> VfsResult<()> {
        let target = self.target(path).await?;
        target
            .instance
            .remove_all(&target.residual)
            .await
            .map_err(target.context("remove_all"))
    }

    /// Rename within one mount.
    pub async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        let source = self.mounts.resolve(&from)?;
        let dest = self.mounts.resolve(&to)?;
        if !Arc::ptr_eq(&source.mount, &dest.mount) {
            return Err(VfsError::CrossMount { from, to });
        }

        let target = self.target(&from).await?;
        target
            .instance
            .rename(&target.residual, &dest.residual)
            .await
            .map_err(target.context("rename"))
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let target = self.target(path).await?;
        target
            .instance
            .chmod(&target.residual, mode)
            .await
            .map_err(target.context("chmod"))
    }

    /// Update the modification time, creating an empty file if absent.
    pub async fn touch(&self, path: &str) -> VfsResult<()> {
        let target = self.target(path).await?;
        target
            .instance
            .touch(&target.residual)
            .await
            .map_err(target.context("touch"))
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Open a handle. The serving instance stays bound to it until close.
    pub async fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<HandleId> {
        let normalized = normalize_path(path)?;
        let target = self.target(&normalized).await?;
        // On failure the lease drops here and the instance goes back.
        let file = target
            .instance
            .open(&target.residual, flags, mode)
            .await
            .map_err(target.context("open"))?;
        let Target { instance, .. } = target;
        Ok(self.handles.insert(normalized, flags, file, instance))
    }

    /// Read from a handle; at `offset` if given, else at its cursor.
    pub async fn handle_read(
        &self,
        id: HandleId,
        size: u64,
        offset: Option<u64>,
    ) -> VfsResult<Vec<u8>> {
        self.handles.read(id, size, offset).await
    }

    /// Write through a handle; at `offset` if given, else at its cursor.
    pub async fn handle_write(
        &self,
        id: HandleId,
        data: &[u8],
        offset: Option<u64>,
    ) -> VfsResult<u64> {
        self.handles.write(id, data, offset).await
    }

    pub async fn handle_seek(&self, id: HandleId, offset: i64, whence: Whence) -> VfsResult<u64> {
        self.handles.seek(id, offset, whence).await
    }

    pub async fn handle_sync(&self, id: HandleId) -> VfsResult<()> {
        self.handles.sync(id).await
    }

    pub async fn handle_stat(&self, id: HandleId) -> VfsResult<FileInfo> {
        self.handles.stat(id).await
    }

    /// Close a handle, releasing its instance even if the backend close
    /// fails.
    pub async fn close(&self, id: HandleId) -> VfsResult<()> {
        self.handles.close(id).await
    }

    pub fn handle_info(&self, id: HandleId) -> VfsResult<HandleInfo> {
        self.handles.info(id)
    }

    /// Open handles ordered by id.
    pub fn list_handles(&self) -> Vec<HandleInfo> {
        self.handles.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtins_registered() {
        let fs = MountableFs::new();
        assert_eq!(fs.plugin_types(), vec!["localfs", "memfs"]);
        assert!(fs.list_mounts().is_empty());
        assert!(fs.list_plugins().is_empty());
    }

    #[tokio::test]
    async fn test_capabilities_report() {
        let caps = MountableFs::new().capabilities();
        assert_eq!(caps.version, crate::VERSION);
        assert!(caps.features.iter().any(|f| f == "handlefs"));
        assert!(caps.features.iter().any(|f| f == "plugins"));
    }

    #[tokio::test]
    async fn test_health_counts() {
        let fs = MountableFs::new();
        assert_eq!(
            fs.health(),
            FsHealth {
                mounts: 0,
                open_handles: 0,
                loaded_plugins: 0,
            }
        );

        fs.mount("/mem", MEMFS, MountConfig::new()).await.unwrap();
        let id = fs.open("/mem/f", OpenFlags::create(), 0o644).await.unwrap();
        let health = fs.health();
        assert_eq!(health.mounts, 1);
        assert_eq!(health.open_handles, 1);

        fs.close(id).await.unwrap();
        assert_eq!(fs.health().open_handles, 0);
    }

    #[tokio::test]
    async fn test_mount_normalizes_path() {
        let fs = MountableFs::new();
        fs.mount("/mem//", MEMFS, MountConfig::new()).await.unwrap();
        assert_eq!(fs.list_mounts()[0].path, "/mem");

        let err = fs.mount("/mem", MEMFS, MountConfig::new()).await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidArgument(_)));

        let err = fs.mount("mem", MEMFS, MountConfig::new()).await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_mount_primes_one_instance() {
        let fs = MountableFs::new();
        fs.mount("/mem", MEMFS, MountConfig::new()).await.unwrap();
        let stats = fs.pool_stats("/mem").unwrap();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_bad_config_is_plugin_init_failed() {
        let fs = MountableFs::new();
        let err = fs
            .mount("/disk", LOCALFS, MountConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::PluginInitFailed { ref plugin, .. } if plugin == "localfs"));
        assert!(fs.list_mounts().is_empty());
    }

    #[tokio::test]
    async fn test_unmount_unknown_is_not_mounted() {
        let fs = MountableFs::new();
        let err = fs.unmount("/nothing").await.unwrap_err();
        assert!(matches!(err, VfsError::NotMounted(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_no_mount_is_not_found() {
        let fs = MountableFs::new();
        let err = fs.read("/x", 0, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let fs = MountableFs::new();
        fs.mount("/a", MEMFS, MountConfig::new()).await.unwrap();
        fs.mount("/b", MEMFS, MountConfig::new()).await.unwrap();
        let id = fs.open("/a/f", OpenFlags::create(), 0o644).await.unwrap();

        fs.shutdown().await;
        assert!(fs.list_mounts().is_empty());
        assert!(fs.list_handles().is_empty());
        assert!(matches!(
            fs.handle_read(id, 1, None).await,
            Err(VfsError::UnknownHandle(_))
        ));
    }
}
