//! Built-in backends.

mod local;
mod memory;

pub use local::{LocalBackend, LOCALFS};
pub use memory::{MemoryBackend, MemoryStore, MEMFS};
