//! RocksDB backend for the grove forest

pub mod adapter;

// Re-export the adapter and related types
pub use adapter::{RocksDBBatch, RocksDBStoreAdapter};

pub use grove_runtime::{BatchLike, Grove, GroveConfig, KeyValueStoreLike};

/// Forest persisted in RocksDB
pub type RocksGrove = Grove<RocksDBStoreAdapter>;

/// Opens (or creates) the database at `path` and initializes the forest in it
pub fn open_rocks_grove(path: &str, config: GroveConfig) -> anyhow::Result<RocksGrove> {
    let adapter = RocksDBStoreAdapter::open_optimized(path)?;
    let mut grove = Grove::new(adapter, config)?;
    grove.init()?;
    Ok(grove)
}
