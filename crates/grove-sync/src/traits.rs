//! Adapter traits for collaborators of the lifecycle engine

use crate::SyncResult;
use async_trait::async_trait;
use grove_runtime::Field;

/// Source of raw block bytes, such as a layer-1 calldata reader or a peer
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Raw bytes of the block `hash` proposed at layer-1 block `l1_origin`;
    /// `Ok(None)` when the bytes are not available yet
    async fn fetch_block(&self, hash: &Field, l1_origin: u64) -> SyncResult<Option<Vec<u8>>>;

    /// Check if the source is reachable
    async fn is_available(&self) -> bool {
        true
    }
}
