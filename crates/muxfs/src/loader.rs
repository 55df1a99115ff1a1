//! Runtime plugin loading.
//!
//! A plugin module is a `cdylib` that exports one [`PluginDeclaration`]
//! under [`DECLARATION_SYMBOL`], normally through [`declare_plugin!`]:
//!
//! ```ignore
//! muxfs::declare_plugin!("hellofs", HelloFs::factory());
//! ```
//!
//! Loading goes: open module → find declaration → check ABI → build a trial
//! instance → probe it → register. The module stays mapped for as long as
//! anything built from it (registration, mount, pooled instance) is alive.
//!
//! Declarations compiled into the process can go through the same checks
//! with [`PluginLoader::load_static`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{VfsError, VfsResult};
use crate::mount::MountTable;
use crate::ops::{Capabilities, VfsOps};
use crate::registry::{PluginFactory, PluginRegistry, RegisteredPlugin};
use crate::types::{ModuleInfo, MountConfig};

/// Bumped whenever [`PluginDeclaration`] or the backend traits change shape.
pub const ABI_VERSION: u32 = 1;

/// Exported symbol holding a module's [`PluginDeclaration`].
pub const DECLARATION_SYMBOL: &str = "MUXFS_PLUGIN_DECLARATION";

/// What a plugin module exports.
///
/// Trait objects cross the module boundary, so the module must be built
/// against the same muxfs version with the same compiler.
#[derive(Debug, Clone, Copy)]
pub struct PluginDeclaration {
    pub abi_version: u32,
    /// `muxfs` crate version the module was built against.
    pub muxfs_version: &'static str,
    /// Plugin type name to register.
    pub name: &'static str,
    /// Builds the plugin's factory.
    pub factory: fn() -> Box<dyn PluginFactory>,
}

/// Export a [`PluginDeclaration`] from a plugin crate.
///
/// `$factory` is any expression producing a [`PluginFactory`].
#[macro_export]
macro_rules! declare_plugin {
    ($name:expr, $factory:expr) => {
        #[unsafe(no_mangle)]
        pub static MUXFS_PLUGIN_DECLARATION: $crate::PluginDeclaration =
            $crate::PluginDeclaration {
                abi_version: $crate::ABI_VERSION,
                muxfs_version: $crate::VERSION,
                name: $name,
                factory: {
                    fn __muxfs_plugin_factory() -> ::std::boxed::Box<dyn $crate::PluginFactory> {
                        ::std::boxed::Box::new($factory)
                    }
                    __muxfs_plugin_factory
                },
            };
    };
}

/// A mapped plugin module.
///
/// `library` is `None` for declarations linked into the process.
pub struct PluginModule {
    path: PathBuf,
    library: Option<Library>,
}

impl std::fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginModule")
            .field("path", &self.path)
            .field("dynamic", &self.library.is_some())
            .finish()
    }
}

impl PluginModule {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PluginModule {
    fn drop(&mut self) {
        if self.library.is_some() {
            debug!(path = %self.path.display(), "Unmapping plugin module");
        }
    }
}

struct LoadedModule {
    name: String,
    module: Arc<PluginModule>,
}

/// Loads and unloads plugin modules into a registry.
pub struct PluginLoader {
    registry: Arc<PluginRegistry>,
    mounts: Arc<MountTable>,
    loaded: Mutex<BTreeMap<PathBuf, LoadedModule>>,
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("loaded", &self.loaded.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> VfsError {
    VfsError::InvalidPlugin {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Canonical form used as the module key; falls back to the path as given
/// when it no longer exists.
fn module_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

impl PluginLoader {
    pub fn new(registry: Arc<PluginRegistry>, mounts: Arc<MountTable>) -> Self {
        Self {
            registry,
            mounts,
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load a plugin module and register the type it declares.
    ///
    /// Returns the registered type name.
    pub async fn load(&self, path: impl AsRef<Path>) -> VfsResult<String> {
        let path = module_key(path.as_ref());
        if self.loaded.lock().contains_key(&path) {
            return Err(VfsError::AlreadyRegistered(format!(
                "module {} already loaded",
                path.display()
            )));
        }

        // SAFETY: loading a module runs its initializers. Modules are
        // trusted code supplied by the operator.
        let library = unsafe { Library::new(&path) }.map_err(|e| VfsError::LoadFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let declaration = {
            // SAFETY: the symbol is declared by `declare_plugin!` as a
            // `static PluginDeclaration`; the ABI version is checked before
            // any other field is trusted.
            let symbol = unsafe {
                library.get::<*const PluginDeclaration>(DECLARATION_SYMBOL.as_bytes())
            }
            .map_err(|e| invalid(&path, format!("missing {DECLARATION_SYMBOL}: {e}")))?;
            let raw: *const PluginDeclaration = *symbol;
            if raw.is_null() {
                return Err(invalid(&path, "null declaration"));
            }
            // SAFETY: non-null, points at a static inside `library`, which
            // outlives this borrow.
            let abi_version = unsafe { std::ptr::addr_of!((*raw).abi_version).read() };
            if abi_version != ABI_VERSION {
                return Err(invalid(
                    &path,
                    format!("ABI version {abi_version}, expected {ABI_VERSION}"),
                ));
            }
            // SAFETY: same ABI version, so the layout matches ours.
            unsafe { *raw }
        };

        let module = Arc::new(PluginModule {
            path: path.clone(),
            library: Some(library),
        });
        self.install(declaration, module).await
    }

    /// Register a declaration linked into the process, with the same
    /// validation as a dynamic load. `origin` names it in listings.
    pub async fn load_static(
        &self,
        declaration: &'static PluginDeclaration,
        origin: impl Into<PathBuf>,
    ) -> VfsResult<String> {
        let path = origin.into();
        if self.loaded.lock().contains_key(&path) {
            return Err(VfsError::AlreadyRegistered(format!(
                "module {} already loaded",
                path.display()
            )));
        }
        if declaration.abi_version != ABI_VERSION {
            return Err(invalid(
                &path,
                format!(
                    "ABI version {}, expected {ABI_VERSION}",
                    declaration.abi_version
                ),
            ));
        }
        let module = Arc::new(PluginModule {
            path,
            library: None,
        });
        self.install(*declaration, module).await
    }

    async fn install(
        &self,
        declaration: PluginDeclaration,
        module: Arc<PluginModule>,
    ) -> VfsResult<String> {
        let path = module.path().to_path_buf();
        if declaration.muxfs_version != crate::VERSION {
            return Err(invalid(
                &path,
                format!(
                    "built against muxfs {}, host is {}",
                    declaration.muxfs_version,
                    crate::VERSION
                ),
            ));
        }
        let name = declaration.name;
        if name.is_empty() || name.contains('/') {
            return Err(invalid(&path, format!("bad plugin name {name:?}")));
        }
        let name = name.to_string();

        let factory: Arc<dyn PluginFactory> = Arc::from((declaration.factory)());
        probe(&path, &name, factory.as_ref()).await?;

        let plugin = RegisteredPlugin::dynamic(name.clone(), factory, Arc::clone(&module));
        let mut loaded = self.loaded.lock();
        if loaded.contains_key(&path) {
            return Err(VfsError::AlreadyRegistered(format!(
                "module {} already loaded",
                path.display()
            )));
        }
        self.registry.insert(plugin)?;
        loaded.insert(
            path.clone(),
            LoadedModule {
                name: name.clone(),
                module,
            },
        );
        info!(path = %path.display(), name = %name, "Loaded plugin module");
        Ok(name)
    }

    /// Deregister the type a module provides and release the module.
    ///
    /// Fails with `InUse` while any mount still uses the type.
    pub fn unload(&self, path: impl AsRef<Path>) -> VfsResult<()> {
        let path = module_key(path.as_ref());
        let mut loaded = self.loaded.lock();
        let entry = loaded
            .get(&path)
            .ok_or_else(|| VfsError::not_found(format!("module {} not loaded", path.display())))?;

        // Registry write lock is held while the mount table is consulted,
        // so no mount can pick the type up in between.
        self.registry.remove_if(&entry.name, |plugin| {
            let users = self.mounts.mounts_using(plugin);
            if users.is_empty() {
                Ok(())
            } else {
                Err(VfsError::InUse(format!(
                    "{} is mounted at {}",
                    entry.name,
                    users.join(", ")
                )))
            }
        })?;

        if let Some(entry) = loaded.remove(&path) {
            let lingering = self.mounts.mounts_using_module(&entry.module);
            if !lingering.is_empty() {
                warn!(path = %path.display(), mounts = ?lingering, "Module still referenced after unload");
            }
            info!(path = %path.display(), name = %entry.name, "Unloaded plugin module");
        }
        Ok(())
    }

    /// Loaded modules and the type each registered, ordered by path.
    pub fn list_loaded(&self) -> Vec<ModuleInfo> {
        self.loaded
            .lock()
            .iter()
            .map(|(path, entry)| ModuleInfo {
                path: path.clone(),
                name: entry.name.clone(),
            })
            .collect()
    }
}

/// Build a trial instance and check it answers the full interface.
///
/// A factory that rejects an empty configuration with `InvalidArgument`
/// needs mount options; its instances are checked at mount time instead.
async fn probe(path: &Path, name: &str, factory: &dyn PluginFactory) -> VfsResult<()> {
    let instances = match factory.configure(&MountConfig::new()) {
        Ok(instances) => instances,
        Err(VfsError::InvalidArgument(reason)) => {
            debug!(name = %name, reason = %reason, "Plugin needs configuration, skipping probe");
            return Ok(());
        }
        Err(e) => return Err(invalid(path, format!("configure failed: {e}"))),
    };
    let instance = instances
        .create()
        .map_err(|e| invalid(path, format!("trial instance failed: {e}")))?;

    let missing = Capabilities::REQUIRED - instance.capabilities();
    let result = if !missing.is_empty() {
        Err(invalid(path, format!("missing capabilities {missing:?}")))
    } else {
        exercise(instance.as_ref())
            .await
            .map_err(|reason| invalid(path, reason))
    };

    if let Err(e) = instance.shutdown().await {
        warn!(name = %name, error = %e, "Trial instance shutdown failed");
    }
    debug!(name = %name, ok = result.is_ok(), "Probed plugin");
    result
}

/// Call the operations that leave the backend unchanged and reject any
/// that turn out to be unsupported despite the declared capabilities.
/// Other errors are fine: an empty backend may well have nothing to read.
async fn exercise(instance: &dyn VfsOps) -> Result<(), String> {
    let root = Path::new("");
    let outcomes = [
        ("stat", instance.stat(root).await.err()),
        ("read_dir", instance.read_dir(root).await.err()),
        ("read", instance.read(root, 0, 0).await.err()),
    ];
    for (op, outcome) in outcomes {
        if let Some(VfsError::Unsupported(what)) = outcome {
            return Err(format!("{op} unsupported: {what}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::ops::VfsOps;
    use crate::registry::InstanceFactory;
    use async_trait::async_trait;
    use std::path::Path;

    const ALTMEM: PluginDeclaration = PluginDeclaration {
        abi_version: ABI_VERSION,
        muxfs_version: crate::VERSION,
        name: "altmem",
        factory: || Box::new(MemoryBackend::factory()),
    };

    static MEM_DECL: PluginDeclaration = ALTMEM;

    static CLASH_DECL: PluginDeclaration = PluginDeclaration {
        name: "memfs",
        ..ALTMEM
    };

    static OLD_ABI_DECL: PluginDeclaration = PluginDeclaration {
        abi_version: ABI_VERSION + 1,
        ..ALTMEM
    };

    /// Backend answering reads only, claiming whatever it is told to.
    struct Partial {
        claims: Capabilities,
        lists: bool,
    }

    #[async_trait]
    impl VfsOps for Partial {
        async fn read_dir(&self, _: &Path) -> VfsResult<Vec<crate::types::FileInfo>> {
            if self.lists {
                Ok(Vec::new())
            } else {
                Err(VfsError::unsupported("read_dir"))
            }
        }
        async fn read(&self, _: &Path, _: u64, _: u64) -> VfsResult<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn stat(&self, _: &Path) -> VfsResult<crate::types::FileInfo> {
            Ok(crate::types::FileInfo::directory("", 0o555))
        }
        async fn write(
            &self,
            _: &Path,
            _: &[u8],
            _: u64,
            _: crate::types::WriteFlags,
        ) -> VfsResult<u64> {
            Err(VfsError::unsupported("write"))
        }
        async fn create(&self, _: &Path) -> VfsResult<()> {
            Err(VfsError::unsupported("create"))
        }
        async fn mkdir(&self, _: &Path, _: u32) -> VfsResult<()> {
            Err(VfsError::unsupported("mkdir"))
        }
        async fn remove(&self, _: &Path) -> VfsResult<()> {
            Err(VfsError::unsupported("remove"))
        }
        async fn remove_all(&self, _: &Path) -> VfsResult<()> {
            Err(VfsError::unsupported("remove_all"))
        }
        async fn rename(&self, _: &Path, _: &Path) -> VfsResult<()> {
            Err(VfsError::unsupported("rename"))
        }
        async fn chmod(&self, _: &Path, _: u32) -> VfsResult<()> {
            Err(VfsError::unsupported("chmod"))
        }
        async fn touch(&self, _: &Path) -> VfsResult<()> {
            Err(VfsError::unsupported("touch"))
        }
        fn capabilities(&self) -> Capabilities {
            self.claims
        }
    }

    static HALF_DECL: PluginDeclaration = PluginDeclaration {
        abi_version: ABI_VERSION,
        muxfs_version: crate::VERSION,
        name: "half",
        factory: || {
            Box::new(|_: &MountConfig| -> VfsResult<Arc<dyn InstanceFactory>> {
                Ok(Arc::new(|| -> VfsResult<Box<dyn VfsOps>> {
                    Ok(Box::new(Partial {
                        claims: Capabilities::READ_DIR | Capabilities::READ | Capabilities::STAT,
                        lists: true,
                    }))
                }))
            })
        },
    };

    static OVERCLAIM_DECL: PluginDeclaration = PluginDeclaration {
        abi_version: ABI_VERSION,
        muxfs_version: crate::VERSION,
        name: "overclaim",
        factory: || {
            Box::new(|_: &MountConfig| -> VfsResult<Arc<dyn InstanceFactory>> {
                Ok(Arc::new(|| -> VfsResult<Box<dyn VfsOps>> {
                    Ok(Box::new(Partial {
                        claims: Capabilities::REQUIRED,
                        lists: false,
                    }))
                }))
            })
        },
    };

    fn loader() -> PluginLoader {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register_builtin("memfs", MemoryBackend::factory())
            .unwrap();
        PluginLoader::new(registry, Arc::new(MountTable::new()))
    }

    #[tokio::test]
    async fn test_missing_module_is_load_failed() {
        let loader = loader();
        let err = loader
            .load("/definitely/not/a/plugin.so")
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::LoadFailed { .. }));
        assert!(loader.list_loaded().is_empty());
    }

    #[tokio::test]
    async fn test_non_library_is_load_failed() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.so");
        std::fs::write(&bogus, b"not an ELF file").unwrap();

        let err = loader().load(&bogus).await.unwrap_err();
        assert!(matches!(err, VfsError::LoadFailed { .. }));
    }

    #[tokio::test]
    async fn test_load_static_and_unload() {
        let loader = loader();
        let name = loader.load_static(&MEM_DECL, "builtin:altmem").await.unwrap();
        assert_eq!(name, "altmem");
        assert!(loader.registry.get("altmem").is_ok());

        let listed = loader.list_loaded();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "altmem");
        assert_eq!(listed[0].path, PathBuf::from("builtin:altmem"));

        loader.unload("builtin:altmem").unwrap();
        assert!(loader.registry.get("altmem").is_err());
        assert!(loader.list_loaded().is_empty());
    }

    #[tokio::test]
    async fn test_name_collision_keeps_builtin() {
        let loader = loader();
        let before = loader.registry.get("memfs").unwrap();

        let err = loader.load_static(&CLASH_DECL, "clash").await.unwrap_err();
        assert!(matches!(err, VfsError::AlreadyRegistered(_)));
        assert!(Arc::ptr_eq(&before, &loader.registry.get("memfs").unwrap()));
        assert!(loader.list_loaded().is_empty());
    }

    #[tokio::test]
    async fn test_abi_mismatch_is_invalid() {
        let err = loader()
            .load_static(&OLD_ABI_DECL, "old")
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::InvalidPlugin { .. }));
    }

    #[tokio::test]
    async fn test_incomplete_backend_is_invalid() {
        let loader = loader();
        let err = loader.load_static(&HALF_DECL, "half").await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidPlugin { ref reason, .. } if reason.contains("capabilities")));
        assert!(loader.registry.get("half").is_err());
    }

    #[tokio::test]
    async fn test_unsupported_required_op_is_invalid() {
        let loader = loader();
        let err = loader
            .load_static(&OVERCLAIM_DECL, "overclaim")
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::InvalidPlugin { ref reason, .. } if reason.contains("read_dir")));
        assert!(loader.registry.get("overclaim").is_err());
        assert!(loader.list_loaded().is_empty());
    }

    #[tokio::test]
    async fn test_unload_unknown_module() {
        let err = loader().unload("/never/loaded.so").unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
    }
}
