use anyhow::{anyhow, Result};
use grove_runtime::{Field, Grove, GroveConfig, Item, KeyValueStoreLike, Note};
use grove_sync::mock::{BlockBuilder, MockBlockSource};
use grove_sync::{BlockBody, BlockLifecycle, LifecycleConfig};
use memgrove::{open_mem_grove, MemGrove, MemStoreAdapter};
use rockgrove::{open_rocks_grove, RocksGrove};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Configuration for setting up a test environment
pub struct TestConfig {
    pub grove: GroveConfig,
    pub lifecycle: LifecycleConfig,
}

impl TestConfig {
    /// Small trees so that generations fill up within a few blocks, and no
    /// challenge window
    pub fn new() -> Self {
        Self {
            grove: GroveConfig {
                utxo_tree_depth: 4,
                withdrawal_tree_depth: 5,
                nullifier_tree_depth: 32,
                utxo_subtree_size: 2,
                withdrawal_subtree_size: 1,
                ..Default::default()
            },
            lifecycle: LifecycleConfig {
                challenge_period_secs: 0,
                ..Default::default()
            },
        }
    }

    pub fn with_grove(mut self, grove: GroveConfig) -> Self {
        self.grove = grove;
        self
    }

    pub fn create_mem_grove(&self) -> Result<MemGrove> {
        open_mem_grove(self.grove.clone())
    }

    pub fn create_rocks_grove(&self, dir: &Path) -> Result<RocksGrove> {
        let path = dir.to_str().ok_or_else(|| anyhow!("temp dir {:?} is not utf-8", dir))?;
        open_rocks_grove(path, self.grove.clone())
    }

    /// Producer of honest blocks, backed by its own in-memory forest
    pub fn create_builder(&self) -> Result<BlockBuilder<MemStoreAdapter>> {
        Ok(BlockBuilder::new(MemStoreAdapter::new(), self.grove.clone())?)
    }

    pub fn create_engine<T>(&self, grove: Grove<T>) -> BlockLifecycle<T, MockBlockSource>
    where
        T: KeyValueStoreLike + Send + Sync + 'static,
    {
        BlockLifecycle::new(
            Arc::new(RwLock::new(grove)),
            Arc::new(MockBlockSource::new()),
            self.lifecycle.clone(),
        )
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// General-purpose test utilities
pub struct TestUtils;

impl TestUtils {
    pub fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// `count` untracked items with leaf hashes `start..start + count`
    pub fn items(start: u64, count: u64) -> Vec<Item> {
        (start..start + count).map(|n| Item::new(Field::from_u64(n))).collect()
    }

    pub fn owned_item(leaf: u64, owner: &[u8]) -> Item {
        Item::with_note(
            Field::from_u64(leaf),
            Note {
                owner: owner.to_vec(),
                payload: leaf.to_be_bytes().to_vec(),
            },
        )
    }

    /// A block body whose contents are unique per `seed`
    pub fn body(seed: u64) -> BlockBody {
        BlockBody {
            utxos: Self::items(seed * 100, 3),
            withdrawals: Self::items(seed * 100 + 50, 1),
            nullifiers: vec![Field::from_u64(seed * 1_000_003), Field::from_u64(seed * 1_000_033)],
        }
    }
}
