//! Mock implementations for testing

use crate::types::{Block, BlockBody, BlockHeader};
use crate::{BlockSource, SyncError, SyncResult};
use async_trait::async_trait;
use grove_runtime::{Field, Grove, GroveConfig, GrovePatch, KeyValueStoreLike};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Block source serving bytes registered with [`MockBlockSource::add_block`]
#[derive(Debug, Clone, Default)]
pub struct MockBlockSource {
    blocks: Arc<Mutex<HashMap<Field, Vec<u8>>>>,
    requests: Arc<Mutex<Vec<Field>>>,
}

impl MockBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&self, hash: Field, raw: Vec<u8>) {
        if let Ok(mut blocks) = self.blocks.lock() {
            blocks.insert(hash, raw);
        }
    }

    pub fn remove_block(&self, hash: &Field) {
        if let Ok(mut blocks) = self.blocks.lock() {
            blocks.remove(hash);
        }
    }

    /// Hashes asked for so far, in request order
    pub fn requests(&self) -> Vec<Field> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BlockSource for MockBlockSource {
    async fn fetch_block(&self, hash: &Field, _l1_origin: u64) -> SyncResult<Option<Vec<u8>>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(*hash);
        }
        let blocks = self
            .blocks
            .lock()
            .map_err(|_| SyncError::Storage("mock source lock poisoned".to_string()))?;
        Ok(blocks.get(hash).cloned())
    }
}

/// Produces a valid chain of blocks by running a private reference forest
pub struct BlockBuilder<T: KeyValueStoreLike> {
    grove: Grove<T>,
    parent: Field,
    next_proposal: u64,
}

impl<T: KeyValueStoreLike> BlockBuilder<T> {
    pub fn new(store: T, config: GroveConfig) -> SyncResult<Self> {
        let mut grove = Grove::new(store, config)?;
        grove.init()?;
        Ok(Self {
            grove,
            parent: Field::zero(),
            next_proposal: 1,
        })
    }

    pub fn grove(&self) -> &Grove<T> {
        &self.grove
    }

    pub fn next_proposal(&self) -> u64 {
        self.next_proposal
    }

    /// Honest header for `body` at the next position
    fn header_for(&self, body: &BlockBody) -> SyncResult<BlockHeader> {
        // roots do not depend on the block hash, so a placeholder is fine here
        let preview = GrovePatch {
            block_hash: Field::zero(),
            utxos: body.utxos.clone(),
            withdrawals: body.withdrawals.clone(),
            nullifiers: body.nullifiers.clone(),
        };
        let snapshot = self.grove.dry_patch(&preview)?;
        Ok(BlockHeader {
            parent_hash: self.parent,
            proposal_num: self.next_proposal,
            utxo_root: snapshot.utxo_tree_root,
            utxo_index: snapshot.utxo_tree_index,
            withdrawal_root: snapshot.withdrawal_tree_root,
            withdrawal_index: snapshot.withdrawal_tree_index,
            nullifier_root: snapshot.nullifier_tree_root,
        })
    }

    /// The next block of the chain. The reference forest advances past it.
    pub fn build(&mut self, body: BlockBody) -> SyncResult<Block> {
        let block = Block {
            header: self.header_for(&body)?,
            body,
        };
        self.grove.apply_patch(&block.patch())?;
        self.parent = block.hash();
        self.next_proposal += 1;
        Ok(block)
    }

    /// A block at the next position whose header is altered by `tamper`;
    /// the reference forest does not advance
    pub fn build_tampered<F>(&mut self, body: BlockBody, tamper: F) -> SyncResult<Block>
    where
        F: FnOnce(&mut BlockHeader),
    {
        let mut header = self.header_for(&body)?;
        tamper(&mut header);
        Ok(Block { header, body })
    }
}
