//! Plugin type registry.
//!
//! Maps plugin type names to factories. A factory is configured once per
//! mount and hands back an [`InstanceFactory`] that the mount's pool calls
//! whenever it needs a fresh instance, so every instance of one mount
//! shares whatever the configuration step prepared.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{VfsError, VfsResult};
use crate::loader::PluginModule;
use crate::ops::VfsOps;
use crate::types::{MountConfig, PluginSource};

/// Builds backend instances for one mount.
pub trait InstanceFactory: Send + Sync {
    /// Construct a new, independent instance.
    fn create(&self) -> VfsResult<Box<dyn VfsOps>>;
}

impl<F> InstanceFactory for F
where
    F: Fn() -> VfsResult<Box<dyn VfsOps>> + Send + Sync,
{
    fn create(&self) -> VfsResult<Box<dyn VfsOps>> {
        self()
    }
}

/// Validates per-mount configuration for one plugin type.
pub trait PluginFactory: Send + Sync {
    /// Check `config` and prepare the mount-scoped instance factory.
    fn configure(&self, config: &MountConfig) -> VfsResult<Arc<dyn InstanceFactory>>;
}

impl<F> PluginFactory for F
where
    F: Fn(&MountConfig) -> VfsResult<Arc<dyn InstanceFactory>> + Send + Sync,
{
    fn configure(&self, config: &MountConfig) -> VfsResult<Arc<dyn InstanceFactory>> {
        self(config)
    }
}

/// A registered plugin type.
pub struct RegisteredPlugin {
    name: String,
    factory: Arc<dyn PluginFactory>,
    source: PluginSource,
    // Dropped after `factory`: code behind the factory lives in the module.
    module: Option<Arc<PluginModule>>,
}

impl std::fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

impl RegisteredPlugin {
    pub fn builtin(name: impl Into<String>, factory: Arc<dyn PluginFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
            source: PluginSource::Builtin,
            module: None,
        }
    }

    pub(crate) fn dynamic(
        name: impl Into<String>,
        factory: Arc<dyn PluginFactory>,
        module: Arc<PluginModule>,
    ) -> Self {
        Self {
            name: name.into(),
            factory,
            source: PluginSource::Dynamic {
                path: module.path().to_path_buf(),
            },
            module: Some(module),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &PluginSource {
        &self.source
    }

    /// Configure a mount, mapping any rejection to `PluginInitFailed`.
    pub fn configure(&self, config: &MountConfig) -> VfsResult<Arc<dyn InstanceFactory>> {
        self.factory
            .configure(config)
            .map_err(|e| VfsError::PluginInitFailed {
                plugin: self.name.clone(),
                message: e.to_string(),
            })
    }

    pub(crate) fn module(&self) -> Option<&Arc<PluginModule>> {
        self.module.as_ref()
    }
}

/// Name → factory map shared by the mount table and the loader.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<BTreeMap<String, Arc<RegisteredPlugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in plugin type.
    pub fn register_builtin(
        &self,
        name: impl Into<String>,
        factory: impl PluginFactory + 'static,
    ) -> VfsResult<()> {
        self.insert(RegisteredPlugin::builtin(name, Arc::new(factory)))
            .map(|_| ())
    }

    /// Insert a registration; an existing name is never replaced.
    pub fn insert(&self, plugin: RegisteredPlugin) -> VfsResult<Arc<RegisteredPlugin>> {
        let mut plugins = self.plugins.write();
        if plugins.contains_key(plugin.name()) {
            return Err(VfsError::AlreadyRegistered(plugin.name().to_string()));
        }
        let plugin = Arc::new(plugin);
        info!(name = %plugin.name(), source = ?plugin.source(), "Registered plugin type");
        plugins.insert(plugin.name().to_string(), Arc::clone(&plugin));
        Ok(plugin)
    }

    /// Look up a plugin type.
    pub fn get(&self, name: &str) -> VfsResult<Arc<RegisteredPlugin>> {
        self.plugins
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VfsError::UnknownPluginType(name.to_string()))
    }

    /// True if `plugin` is still the live registration under its name.
    pub fn is_current(&self, plugin: &Arc<RegisteredPlugin>) -> bool {
        self.plugins
            .read()
            .get(plugin.name())
            .is_some_and(|current| Arc::ptr_eq(current, plugin))
    }

    /// Names of all registered plugin types, sorted.
    pub fn names(&self) -> Vec<String> {
        self.plugins.read().keys().cloned().collect()
    }

    /// Remove a registration while holding the write lock, letting `check`
    /// veto the removal.
    pub(crate) fn remove_if<F>(&self, name: &str, check: F) -> VfsResult<Arc<RegisteredPlugin>>
    where
        F: FnOnce(&RegisteredPlugin) -> VfsResult<()>,
    {
        let mut plugins = self.plugins.write();
        let plugin = plugins
            .get(name)
            .ok_or_else(|| VfsError::UnknownPluginType(name.to_string()))?;
        check(plugin)?;
        let removed = plugins.remove(name).expect("entry checked under the same lock");
        info!(name = %name, "Deregistered plugin type");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;

    fn memfs_factory() -> impl PluginFactory + 'static {
        |_config: &MountConfig| -> VfsResult<Arc<dyn InstanceFactory>> {
            Ok(Arc::new(|| -> VfsResult<Box<dyn VfsOps>> {
                Ok(Box::new(MemoryBackend::new()))
            }))
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = PluginRegistry::new();
        registry.register_builtin("memfs", memfs_factory()).unwrap();

        let plugin = registry.get("memfs").unwrap();
        assert_eq!(plugin.name(), "memfs");
        assert_eq!(plugin.source(), &PluginSource::Builtin);
        assert!(registry.is_current(&plugin));
        assert_eq!(registry.names(), vec!["memfs".to_string()]);
    }

    #[test]
    fn test_duplicate_name_keeps_first() {
        let registry = PluginRegistry::new();
        registry.register_builtin("memfs", memfs_factory()).unwrap();
        let first = registry.get("memfs").unwrap();

        let err = registry.register_builtin("memfs", memfs_factory()).unwrap_err();
        assert!(matches!(err, VfsError::AlreadyRegistered(name) if name == "memfs"));
        assert!(Arc::ptr_eq(&first, &registry.get("memfs").unwrap()));
    }

    #[test]
    fn test_unknown_plugin_type() {
        let registry = PluginRegistry::new();
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(err, VfsError::UnknownPluginType(_)));
    }

    #[test]
    fn test_configure_failure_is_plugin_init_failed() {
        let registry = PluginRegistry::new();
        registry
            .register_builtin(
                "picky",
                |_config: &MountConfig| -> VfsResult<Arc<dyn InstanceFactory>> {
                    Err(VfsError::invalid_argument("missing bucket"))
                },
            )
            .unwrap();

        let err = registry
            .get("picky")
            .unwrap()
            .configure(&MountConfig::new())
            .err()
            .unwrap();
        assert!(matches!(err, VfsError::PluginInitFailed { ref plugin, .. } if plugin == "picky"));
    }

    #[test]
    fn test_remove_if_veto() {
        let registry = PluginRegistry::new();
        registry.register_builtin("memfs", memfs_factory()).unwrap();

        let err = registry
            .remove_if("memfs", |_| Err(VfsError::InUse("/mem".into())))
            .unwrap_err();
        assert!(matches!(err, VfsError::InUse(_)));
        assert!(registry.get("memfs").is_ok());

        registry.remove_if("memfs", |_| Ok(())).unwrap();
        assert!(registry.get("memfs").is_err());
    }
}
