//! In-memory backend for the grove forest, for tests and previews

pub mod adapter;

// Re-export the adapter and related types
pub use adapter::{MemStoreAdapter, MemStoreBatch};

pub use grove_runtime::{BatchLike, Grove, GroveConfig, KeyValueStoreLike};

/// Forest backed by the in-memory store
pub type MemGrove = Grove<MemStoreAdapter>;

/// Builds and initializes an in-memory forest
pub fn open_mem_grove(config: GroveConfig) -> anyhow::Result<MemGrove> {
    let mut grove = Grove::new(MemStoreAdapter::new(), config)?;
    grove.init()?;
    Ok(grove)
}
