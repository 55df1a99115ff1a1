//! Mount table with longest-prefix routing.
//!
//! Mount points are matched by longest prefix on segment boundaries. If
//! `/mnt` and `/mnt/project` are both mounted, `/mnt/project/src/main.rs`
//! routes to `/mnt/project`, and `/mnt/projects` routes to `/mnt`.
//!
//! The table lock covers metadata only. Resolution hands back an
//! `Arc<Mount>` and the lock is released before any backend is called.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{VfsError, VfsResult};
use crate::loader::PluginModule;
use crate::pool::InstancePool;
use crate::registry::RegisteredPlugin;
use crate::types::{MountConfig, MountInfo};

/// Normalize an absolute path.
///
/// Collapses repeated separators, drops `.` segments, resolves `..` and
/// strips any trailing separator (except for the root itself). Relative
/// paths, NUL bytes and `..` above the root are rejected.
pub fn normalize_path(path: &str) -> VfsResult<String> {
    if !path.starts_with('/') {
        return Err(VfsError::invalid_argument(format!(
            "path must be absolute: {path:?}"
        )));
    }
    if path.contains('\0') {
        return Err(VfsError::invalid_argument("path contains NUL"));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(VfsError::invalid_argument(format!(
                        "path escapes root: {path:?}"
                    )));
                }
            }
            name => segments.push(name),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Parent of a normalized path, `None` for the root.
fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Path of `path` below `mount`, relative (empty for the mount root).
fn residual(mount: &str, path: &str) -> PathBuf {
    let rest = if mount == "/" {
        path
    } else {
        &path[mount.len()..]
    };
    PathBuf::from(rest.trim_start_matches('/'))
}

/// An installed mount.
pub struct Mount {
    path: String,
    config: MountConfig,
    pool: InstancePool,
    // Dropped after `pool`: plugin code behind the instances lives in the
    // registration's module.
    plugin: Arc<RegisteredPlugin>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("path", &self.path)
            .field("plugin", &self.plugin.name())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Mount {
    pub fn new(
        path: String,
        plugin: Arc<RegisteredPlugin>,
        config: MountConfig,
        pool: InstancePool,
    ) -> Self {
        Self {
            path,
            config,
            pool,
            plugin,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn plugin(&self) -> &Arc<RegisteredPlugin> {
        &self.plugin
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    pub fn info(&self) -> MountInfo {
        MountInfo {
            path: self.path.clone(),
            plugin: self.plugin.name().to_string(),
        }
    }

    /// True if this mount runs code from `module`.
    pub(crate) fn uses_module(&self, module: &Arc<PluginModule>) -> bool {
        self.plugin
            .module()
            .is_some_and(|m| Arc::ptr_eq(m, module))
    }
}

/// A path resolved to its owning mount.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub mount: Arc<Mount>,
    /// Path below the mount root, relative; empty for the root itself.
    pub residual: PathBuf,
}

/// Mount path → mount.
#[derive(Default)]
pub struct MountTable {
    mounts: RwLock<BTreeMap<String, Arc<Mount>>>,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable")
            .field("mounts", &self.mounts.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a mount. The path must be normalized and not yet mounted.
    pub fn insert(&self, mount: Mount) -> VfsResult<Arc<Mount>> {
        let mut mounts = self.mounts.write();
        if mounts.contains_key(mount.path()) {
            return Err(VfsError::invalid_argument(format!(
                "already mounted: {}",
                mount.path()
            )));
        }
        let mount = Arc::new(mount);
        mounts.insert(mount.path().to_string(), Arc::clone(&mount));
        Ok(mount)
    }

    /// Whether something is mounted at exactly `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.mounts.read().contains_key(path)
    }

    /// Mount at exactly `path`.
    pub fn get(&self, path: &str) -> Option<Arc<Mount>> {
        self.mounts.read().get(path).cloned()
    }

    /// Remove `mount` if it is still the one installed at its path.
    pub fn remove(&self, mount: &Arc<Mount>) -> bool {
        let mut mounts = self.mounts.write();
        match mounts.get(mount.path()) {
            Some(current) if Arc::ptr_eq(current, mount) => {
                mounts.remove(mount.path());
                true
            }
            _ => false,
        }
    }

    /// Route a normalized path to the mount with the longest matching
    /// prefix.
    pub fn resolve(&self, path: &str) -> VfsResult<Resolved> {
        let mounts = self.mounts.read();
        let mut candidate = Some(path);
        while let Some(prefix) = candidate {
            if let Some(mount) = mounts.get(prefix) {
                let residual = residual(prefix, path);
                debug!(path = %path, mount = %prefix, residual = %residual.display(), "Resolved path");
                return Ok(Resolved {
                    mount: Arc::clone(mount),
                    residual,
                });
            }
            candidate = parent(prefix);
        }
        Err(VfsError::not_found(format!("no mount for {path}")))
    }

    /// All mounts, ordered by path.
    pub fn list(&self) -> Vec<MountInfo> {
        self.mounts.read().values().map(|m| m.info()).collect()
    }

    /// Every installed mount, ordered by path.
    pub fn mounts(&self) -> Vec<Arc<Mount>> {
        self.mounts.read().values().cloned().collect()
    }

    /// Paths of mounts built from `plugin`.
    pub fn mounts_using(&self, plugin: &RegisteredPlugin) -> Vec<String> {
        self.mounts
            .read()
            .values()
            .filter(|m| std::ptr::eq(Arc::as_ptr(m.plugin()), plugin))
            .map(|m| m.path().to_string())
            .collect()
    }

    /// Paths of mounts running code from `module`.
    pub(crate) fn mounts_using_module(&self, module: &Arc<PluginModule>) -> Vec<String> {
        self.mounts
            .read()
            .values()
            .filter(|m| m.uses_module(module))
            .map(|m| m.path().to_string())
            .collect()
    }

    /// Names of the first segments below `dir` that lead to a mount point,
    /// sorted.
    pub fn child_names(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let mut names: Vec<String> = self
            .mounts
            .read()
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty())
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Whether any mount sits at or below `dir`.
    pub fn covers(&self, dir: &str) -> bool {
        self.contains(dir) || !self.child_names(dir).is_empty()
    }
}
