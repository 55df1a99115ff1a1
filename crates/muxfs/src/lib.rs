//! Mountable virtual filesystem multiplexer.
//!
//! Independently implemented backends ("plugins") are attached at path
//! prefixes and served through one path- and handle-based API:
//!
//! - [`VfsOps`] / [`FileHandle`]: the interface every backend implements
//! - [`PluginRegistry`]: plugin type name → factory
//! - [`InstancePool`]: bounded, per-mount set of backend instances
//! - [`MountTable`]: longest-prefix routing from paths to mounts
//! - [`HandleTable`]: open handles pinned to their instance until close
//! - [`PluginLoader`]: plugin modules loaded and unloaded at runtime
//!
//! [`MountableFs`] wires these together.
//!
//! # Example
//!
//! ```no_run
//! use muxfs::{MountConfig, MountableFs, WriteFlags};
//!
//! # async fn example() -> muxfs::VfsResult<()> {
//! let fs = MountableFs::new();
//! fs.mount("/mem", "memfs", MountConfig::new()).await?;
//! fs.write("/mem/hello.txt", b"hello", 0, WriteFlags::CREATE | WriteFlags::TRUNCATE)
//!     .await?;
//! assert_eq!(fs.read("/mem/hello.txt", 0, 5).await?, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod fs;
pub mod handle;
pub mod loader;
pub mod mount;
pub mod ops;
pub mod pool;
pub mod registry;
pub mod types;

/// Version of this crate; plugin modules must be built against the same.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use backends::{LocalBackend, MemoryBackend, MemoryStore, LOCALFS, MEMFS};
pub use config::{ConfigError, MuxConfig};
pub use error::{ErrorKind, VfsError, VfsResult};
pub use fs::{FsCapabilities, FsHealth, MountableFs};
pub use handle::{HandleId, HandleInfo, HandleTable};
pub use loader::{PluginDeclaration, PluginLoader, ABI_VERSION, DECLARATION_SYMBOL};
pub use mount::{normalize_path, Mount, MountTable};
pub use ops::{Capabilities, FileHandle, VfsOps};
pub use pool::{DrainPolicy, InstancePool, PoolConfig, PoolStats, PooledInstance};
pub use registry::{InstanceFactory, PluginFactory, PluginRegistry};
pub use types::{
    FileInfo, ModuleInfo, MountConfig, MountInfo, OpenFlags, PluginSource, Whence, WriteFlags,
};
