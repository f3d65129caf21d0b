//! Block lifecycle engine
//!
//! Tracks every proposed block through
//! `NOT_FETCHED -> FETCHED -> VERIFIED -> FINALIZED` and decides when the
//! forest is touched:
//!
//! - verification only simulates the block on top of the committed forest and
//!   the verified but not yet finalized predecessors;
//! - finalization commits the block's patch and its record in one batch;
//! - a challenge or a reorg invalidates (or reverts) the block and every
//!   later block, cancelling their pending finalization.
//!
//! Blocks are handled strictly in proposal order. A fetched block waits until
//! its predecessor is verified; a verified block waits for its predecessor to
//! be finalized.

use crate::repo::BlockRepo;
use crate::types::{unix_now, Block, BlockRecord, BlockStatus, ChainEvent, LifecycleConfig, LifecycleStats};
use crate::{BlockSource, SyncError, SyncResult};
use grove_runtime::{Field, Grove, GroveResult, GroveSnapshot, KeyValueStoreLike, StoreTransaction};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Forest shared between the engine and proof readers
pub type SharedGrove<T> = Arc<RwLock<Grove<T>>>;

/// Bounded event channel sized from the lifecycle config
pub fn event_channel(config: &LifecycleConfig) -> (mpsc::Sender<ChainEvent>, mpsc::Receiver<ChainEvent>) {
    mpsc::channel(config.channel_capacity)
}

pub async fn send_event(sender: &mpsc::Sender<ChainEvent>, event: ChainEvent) -> SyncResult<()> {
    sender.send(event).await.map_err(|_| SyncError::ChannelClosed)
}

fn transition(record: &mut BlockRecord, to: BlockStatus) -> SyncResult<()> {
    if !record.status.can_transition_to(to) {
        return Err(SyncError::InvalidTransition {
            block: record.hash,
            from: record.status,
            to,
        });
    }
    record.status = to;
    Ok(())
}

/// Replays `pending` and then `block` in a dry session
fn simulate_chain<T: KeyValueStoreLike>(
    grove: &Grove<T>,
    pending: &[Block],
    block: &Block,
) -> GroveResult<GroveSnapshot> {
    let mut session = grove.simulate()?;
    for predecessor in pending {
        session.apply(&predecessor.patch())?;
    }
    session.apply(&block.patch())
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

pub struct BlockLifecycle<T, S>
where
    T: KeyValueStoreLike,
    S: BlockSource,
{
    grove: SharedGrove<T>,
    source: Arc<S>,
    pub config: LifecycleConfig,
    blocks: BTreeMap<u64, BlockRecord>,
    by_hash: HashMap<Field, u64>,
}

impl<T, S> BlockLifecycle<T, S>
where
    T: KeyValueStoreLike + Send + Sync + 'static,
    S: BlockSource + 'static,
{
    pub fn new(grove: SharedGrove<T>, source: Arc<S>, config: LifecycleConfig) -> Self {
        Self {
            grove,
            source,
            config,
            blocks: BTreeMap::new(),
            by_hash: HashMap::new(),
        }
    }

    pub fn grove(&self) -> &SharedGrove<T> {
        &self.grove
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Reloads the persisted records
    pub async fn load(&mut self) -> SyncResult<()> {
        let records = {
            let grove = self.grove.read().await;
            let store = grove.store();
            BlockRepo::load_all(&*store)?
        };
        self.blocks.clear();
        self.by_hash.clear();
        for record in records {
            self.by_hash.insert(record.hash, record.proposal_num);
            self.blocks.insert(record.proposal_num, record);
        }
        info!("Loaded {} block records", self.blocks.len());
        Ok(())
    }

    pub fn record(&self, hash: &Field) -> Option<&BlockRecord> {
        self.by_hash
            .get(hash)
            .and_then(|num| self.blocks.get(num))
            .filter(|record| record.hash == *hash)
    }

    pub fn status(&self, hash: &Field) -> Option<BlockStatus> {
        self.record(hash).map(|record| record.status)
    }

    /// Records in proposal order
    pub fn records(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.values()
    }

    pub fn stats(&self) -> LifecycleStats {
        let mut stats = LifecycleStats::default();
        for record in self.blocks.values() {
            stats.count(record.status);
        }
        stats
    }

    fn proposal_of(&self, hash: &Field) -> SyncResult<u64> {
        self.record(hash)
            .map(|record| record.proposal_num)
            .ok_or(SyncError::UnknownBlock(*hash))
    }

    fn predecessor(&self, proposal_num: u64) -> Option<&BlockRecord> {
        self.blocks.range(..proposal_num).next_back().map(|(_, record)| record)
    }

    /// Deadline of the block that will finalize next, if it is verified
    pub fn next_deadline(&self) -> Option<u64> {
        self.blocks
            .values()
            .find(|record| !record.status.is_terminal())
            .filter(|record| record.status == BlockStatus::Verified)
            .and_then(|record| record.challenge_deadline)
    }

    async fn persist(&self, records: &[BlockRecord]) -> SyncResult<()> {
        let mut tx = StoreTransaction::new();
        for record in records {
            BlockRepo::save(&mut tx, record)?;
        }
        self.grove.write().await.commit_staged(tx)?;
        Ok(())
    }

    fn store_record(&mut self, record: BlockRecord) {
        self.by_hash.insert(record.hash, record.proposal_num);
        self.blocks.insert(record.proposal_num, record);
    }

    pub async fn handle(&mut self, event: ChainEvent) -> SyncResult<()> {
        match event {
            ChainEvent::Proposed {
                hash,
                proposal_num,
                l1_origin,
            } => self.on_proposed(hash, proposal_num, l1_origin).await,
            ChainEvent::Fetched { hash, raw } => self.on_fetched(hash, raw).await,
            ChainEvent::ChallengePeriodElapsed { hash } => {
                self.on_challenge_period_elapsed(hash).await.map(|_| ())
            }
            ChainEvent::Challenged { hash } => self.on_challenged(hash).await.map(|_| ()),
            ChainEvent::Reorged { hash } => self.on_reorg(hash).await.map(|_| ()),
        }
    }

    /// Registers a proposal. Proposals must arrive in order; a reverted slot
    /// may be proposed again.
    pub async fn on_proposed(&mut self, hash: Field, proposal_num: u64, l1_origin: u64) -> SyncResult<()> {
        if let Some(existing) = self.record(&hash) {
            if existing.status != BlockStatus::Reverted {
                debug!("Block {} already known as proposal {}", hash, existing.proposal_num);
                return Ok(());
            }
        }

        let expected = self.blocks.keys().next_back().map(|last| last + 1);
        match self.blocks.get(&proposal_num) {
            Some(slot) if slot.status == BlockStatus::Reverted => {
                info!("Proposal {} replaces reverted block {}", proposal_num, slot.hash);
                let replaced = slot.hash;
                self.by_hash.remove(&replaced);
            }
            Some(_) => {
                return Err(SyncError::OutOfOrderBlock {
                    expected: expected.unwrap_or(proposal_num),
                    got: proposal_num,
                })
            }
            None => {
                if let Some(expected) = expected.filter(|expected| *expected != proposal_num) {
                    return Err(SyncError::OutOfOrderBlock {
                        expected,
                        got: proposal_num,
                    });
                }
            }
        }

        let record = BlockRecord::proposed(hash, proposal_num, l1_origin);
        self.persist(std::slice::from_ref(&record)).await?;
        self.store_record(record);
        debug!("Proposal {} is block {} (l1 origin {})", proposal_num, hash, l1_origin);
        Ok(())
    }

    /// Stores the raw bytes of a proposed block and verifies whatever became
    /// verifiable
    pub async fn on_fetched(&mut self, hash: Field, raw: Vec<u8>) -> SyncResult<()> {
        let num = self.proposal_of(&hash)?;
        let mut record = self.blocks[&num].clone();
        if record.status != BlockStatus::NotFetched {
            debug!("Ignoring bytes for block {} in state {:?}", hash, record.status);
            return Ok(());
        }
        record.raw = Some(raw);
        transition(&mut record, BlockStatus::Fetched)?;
        self.persist(std::slice::from_ref(&record)).await?;
        self.store_record(record);
        self.advance().await?;
        Ok(())
    }

    /// Asks the source for every block still missing its bytes
    pub async fn fetch_missing(&mut self) -> SyncResult<usize> {
        let missing: Vec<(Field, u64)> = self
            .blocks
            .values()
            .filter(|record| record.status == BlockStatus::NotFetched)
            .map(|record| (record.hash, record.l1_origin))
            .collect();
        let mut fetched = 0;
        for (hash, l1_origin) in missing {
            match self.source.fetch_block(&hash, l1_origin).await? {
                Some(raw) => {
                    self.on_fetched(hash, raw).await?;
                    fetched += 1;
                }
                None => debug!("Block {} not available yet", hash),
            }
        }
        Ok(fetched)
    }

    /// Verifies fetched blocks in proposal order, stopping at the first one
    /// whose predecessor is not verified yet
    pub async fn advance(&mut self) -> SyncResult<usize> {
        let mut verified = 0;
        let nums: Vec<u64> = self.blocks.keys().copied().collect();
        for num in nums {
            match self.blocks[&num].status {
                BlockStatus::NotFetched => break,
                BlockStatus::Fetched => {}
                _ => continue,
            }
            match self.predecessor(num).map(|p| (p.hash, p.status)) {
                None | Some((_, BlockStatus::Verified | BlockStatus::Finalized)) => {}
                Some((parent, BlockStatus::Invalidated)) => {
                    self.invalidate_from(num, &format!("parent {} is invalid", parent)).await?;
                    continue;
                }
                Some((parent, BlockStatus::Reverted)) => {
                    warn!("Block {} follows reverted block {}", self.blocks[&num].hash, parent);
                    self.revert_from(num).await?;
                    continue;
                }
                Some(_) => {
                    debug!("Proposal {} waits for its predecessor", num);
                    break;
                }
            }
            if self.verify(num).await? {
                verified += 1;
            }
        }
        Ok(verified)
    }

    /// Why `block` does not belong in slot `record`, if it does not
    fn link_error(&self, record: &BlockRecord, block: &Block) -> Option<String> {
        if block.hash() != record.hash {
            return Some(format!("header hashes to {}", block.hash()));
        }
        if block.header.proposal_num != record.proposal_num {
            return Some(format!(
                "header claims proposal {}, proposed as {}",
                block.header.proposal_num, record.proposal_num
            ));
        }
        match self.predecessor(record.proposal_num) {
            Some(parent) if parent.hash != block.header.parent_hash => Some(format!(
                "parent hash {} does not match predecessor {}",
                block.header.parent_hash, parent.hash
            )),
            _ => None,
        }
    }

    async fn verify(&mut self, num: u64) -> SyncResult<bool> {
        let record = self.blocks[&num].clone();
        let block = match record.block() {
            Ok(block) => block,
            Err(err) => {
                self.invalidate_from(num, &err.to_string()).await?;
                return Ok(false);
            }
        };
        if let Some(reason) = self.link_error(&record, &block) {
            self.invalidate_from(num, &reason).await?;
            return Ok(false);
        }

        let pending = self
            .blocks
            .range(..num)
            .filter(|(_, r)| r.status == BlockStatus::Verified)
            .map(|(_, r)| r.block())
            .collect::<SyncResult<Vec<Block>>>()?;
        let outcome = {
            let grove = self.grove.read().await;
            simulate_chain(&grove, &pending, &block)
        };

        let claimed = block.header.claimed_snapshot();
        match outcome {
            Ok(snapshot) if snapshot == claimed => {
                let mut updated = record;
                transition(&mut updated, BlockStatus::Verified)?;
                let deadline = *updated
                    .challenge_deadline
                    .get_or_insert(unix_now() + self.config.challenge_period_secs);
                self.persist(std::slice::from_ref(&updated)).await?;
                info!("Verified block {} (proposal {}), finalizable at {}", updated.hash, num, deadline);
                self.store_record(updated);
                Ok(true)
            }
            Ok(snapshot) => {
                self.invalidate_from(num, &format!("header claims {:?}, computed {:?}", claimed, snapshot))
                    .await?;
                Ok(false)
            }
            Err(err) if err.is_fatal() => Err(err.into()),
            Err(err) => {
                self.invalidate_from(num, &err.to_string()).await?;
                Ok(false)
            }
        }
    }

    /// Moves the block at `num` and every later live block to `status`,
    /// returning the affected records
    fn cascade(&self, num: u64, status: BlockStatus) -> SyncResult<Vec<BlockRecord>> {
        let mut affected = Vec::new();
        for record in self.blocks.range(num..).map(|(_, r)| r) {
            if record.status.is_terminal() {
                continue;
            }
            let mut updated = record.clone();
            transition(&mut updated, status)?;
            updated.challenge_deadline = None;
            affected.push(updated);
        }
        Ok(affected)
    }

    async fn invalidate_from(&mut self, num: u64, reason: &str) -> SyncResult<usize> {
        let affected = self.cascade(num, BlockStatus::Invalidated)?;
        self.persist(&affected).await?;
        for record in &affected {
            warn!("Invalidated block {} (proposal {}): {}", record.hash, record.proposal_num, reason);
        }
        let count = affected.len();
        for record in affected {
            self.store_record(record);
        }
        Ok(count)
    }

    async fn revert_from(&mut self, num: u64) -> SyncResult<usize> {
        let affected = self.cascade(num, BlockStatus::Reverted)?;
        let mut tx = StoreTransaction::new();
        for record in &affected {
            BlockRepo::save(&mut tx, record)?;
        }
        let hashes: Vec<Field> = affected.iter().map(|record| record.hash).collect();
        let reset = self.grove.write().await.recover_with(&hashes, tx)?;
        for record in &affected {
            warn!("Reverted block {} (proposal {})", record.hash, record.proposal_num);
        }
        debug!("Reorg reset {} nullifiers", reset);
        let count = affected.len();
        for record in affected {
            self.store_record(record);
        }
        Ok(count)
    }

    /// A successful challenge: the block and its descendants are invalid
    pub async fn on_challenged(&mut self, hash: Field) -> SyncResult<usize> {
        let num = self.proposal_of(&hash)?;
        let status = self.blocks[&num].status;
        if status == BlockStatus::Finalized {
            return Err(SyncError::InvalidTransition {
                block: hash,
                from: status,
                to: BlockStatus::Invalidated,
            });
        }
        if status.is_terminal() {
            debug!("Challenge of block {} ignored, already {:?}", hash, status);
            return Ok(0);
        }
        self.invalidate_from(num, "challenged").await
    }

    /// Layer-1 reorg dropped the block: it and its descendants are reverted
    pub async fn on_reorg(&mut self, hash: Field) -> SyncResult<usize> {
        let num = self.proposal_of(&hash)?;
        let status = self.blocks[&num].status;
        if status == BlockStatus::Finalized {
            return Err(SyncError::InvalidTransition {
                block: hash,
                from: status,
                to: BlockStatus::Reverted,
            });
        }
        if status.is_terminal() {
            debug!("Reorg of block {} ignored, already {:?}", hash, status);
            return Ok(0);
        }
        self.revert_from(num).await
    }

    /// The synchronizer reports the challenge window of `hash` closed
    pub async fn on_challenge_period_elapsed(&mut self, hash: Field) -> SyncResult<usize> {
        let num = self.proposal_of(&hash)?;
        let now = unix_now();
        let mut record = self.blocks[&num].clone();
        if record.status.is_terminal() {
            return Ok(0);
        }
        if record.challenge_deadline.map_or(true, |deadline| deadline > now) {
            record.challenge_deadline = Some(now);
            self.persist(std::slice::from_ref(&record)).await?;
            self.store_record(record);
        }
        self.finalize_due(now).await
    }

    /// Finalizes, in order, every verified block whose deadline is at or
    /// before `now`
    pub async fn finalize_due(&mut self, now: u64) -> SyncResult<usize> {
        let mut finalized = 0;
        loop {
            let next = self
                .blocks
                .values()
                .find(|record| !record.status.is_terminal())
                .map(|record| (record.proposal_num, record.status, record.challenge_deadline));
            match next {
                Some((num, BlockStatus::Verified, Some(deadline))) if deadline <= now => {
                    if !self.try_finalize(num).await? {
                        break;
                    }
                    finalized += 1;
                }
                _ => break,
            }
        }
        Ok(finalized)
    }

    /// Commits the block at `num` if its predecessor is finalized. Returns
    /// `false` when it has to keep waiting.
    pub async fn try_finalize(&mut self, num: u64) -> SyncResult<bool> {
        let record = self
            .blocks
            .get(&num)
            .cloned()
            .ok_or_else(|| SyncError::Generic(anyhow::anyhow!("no block at proposal {}", num)))?;
        if record.status != BlockStatus::Verified {
            return Err(SyncError::InvalidTransition {
                block: record.hash,
                from: record.status,
                to: BlockStatus::Finalized,
            });
        }
        if let Some(parent) = self.predecessor(num) {
            match parent.status {
                BlockStatus::Finalized => {}
                BlockStatus::Invalidated | BlockStatus::Reverted => {
                    error!(
                        "Refusing to finalize block {}: parent {} is {:?}",
                        record.hash, parent.hash, parent.status
                    );
                    return Err(SyncError::FinalizedAfterInvalidParent {
                        block: record.hash,
                        parent: parent.hash,
                        parent_status: parent.status,
                    });
                }
                _ => {
                    debug!("Block {} queued behind unfinalized parent {}", record.hash, parent.hash);
                    return Ok(false);
                }
            }
        }

        let block = record.block()?;
        let patch = block.patch();
        let mut updated = record;
        transition(&mut updated, BlockStatus::Finalized)?;
        updated.challenge_deadline = None;
        let mut tx = StoreTransaction::new();
        BlockRepo::save(&mut tx, &updated)?;

        {
            let mut grove = self.grove.write().await;
            if grove.dry_patch(&patch)? != block.header.claimed_snapshot() {
                error!("Block {} diverged from its verified roots", updated.hash);
                return Err(SyncError::DivergedFromHeader { block: updated.hash });
            }
            grove.apply_patch_with(&patch, tx)?;
        }
        info!("Finalized block {} (proposal {})", updated.hash, num);
        self.store_record(updated);
        Ok(true)
    }

    /// Processes events until the channel closes, finalizing blocks as their
    /// challenge deadlines pass. Fatal errors stop the loop; others are
    /// logged and the event is dropped.
    pub async fn run(&mut self, mut events: mpsc::Receiver<ChainEvent>) -> SyncResult<()> {
        info!("Block lifecycle engine started with {} known blocks", self.blocks.len());
        self.advance().await?;
        loop {
            let wait = self
                .next_deadline()
                .map(|deadline| Duration::from_secs(deadline.saturating_sub(unix_now())));
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Event channel closed, stopping lifecycle engine");
                        return Ok(());
                    };
                    if let Err(err) = self.handle(event).await {
                        if err.is_fatal() {
                            error!("Lifecycle engine stopping: {}", err);
                            return Err(err);
                        }
                        warn!("Dropped event: {}", err);
                    }
                }
                _ = sleep_or_pending(wait) => {
                    if let Err(err) = self.finalize_due(unix_now()).await {
                        if err.is_fatal() {
                            error!("Lifecycle engine stopping: {}", err);
                            return Err(err);
                        }
                        warn!("Finalization deferred: {}", err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BlockBuilder, MockBlockSource};
    use crate::types::BlockBody;
    use grove_runtime::{GroveConfig, Item};
    use memgrove::{open_mem_grove, MemStoreAdapter};

    type Engine = BlockLifecycle<MemStoreAdapter, MockBlockSource>;

    fn grove_config() -> GroveConfig {
        GroveConfig {
            utxo_tree_depth: 4,
            withdrawal_tree_depth: 4,
            nullifier_tree_depth: 16,
            utxo_subtree_size: 2,
            withdrawal_subtree_size: 1,
            ..Default::default()
        }
    }

    fn body(seed: u64) -> BlockBody {
        BlockBody {
            utxos: (0..3).map(|i| Item::new(Field::from_u64(seed * 10 + i))).collect(),
            withdrawals: vec![Item::new(Field::from_u64(seed * 1000))],
            nullifiers: vec![Field::from_u64(seed * 100 + 1)],
        }
    }

    fn setup() -> (Engine, BlockBuilder<MemStoreAdapter>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let grove = open_mem_grove(grove_config()).unwrap();
        let engine = BlockLifecycle::new(
            Arc::new(RwLock::new(grove)),
            Arc::new(MockBlockSource::new()),
            LifecycleConfig {
                challenge_period_secs: 0,
                ..Default::default()
            },
        );
        let builder = BlockBuilder::new(MemStoreAdapter::new(), grove_config()).unwrap();
        (engine, builder)
    }

    async fn propose(engine: &mut Engine, block: &Block) {
        let num = block.header.proposal_num;
        engine.on_proposed(block.hash(), num, 100 + num).await.unwrap();
    }

    async fn snapshot(engine: &Engine) -> GroveSnapshot {
        engine.grove().read().await.snapshot().unwrap()
    }

    #[tokio::test]
    async fn test_blocks_verify_in_order_and_finalize() {
        let (mut engine, mut builder) = setup();
        let b1 = builder.build(body(1)).unwrap();
        let b2 = builder.build(body(2)).unwrap();
        propose(&mut engine, &b1).await;
        propose(&mut engine, &b2).await;
        let genesis = snapshot(&engine).await;

        // the second block arrives first and has to wait
        engine.on_fetched(b2.hash(), b2.encode().unwrap()).await.unwrap();
        assert_eq!(engine.status(&b2.hash()), Some(BlockStatus::Fetched));

        engine.on_fetched(b1.hash(), b1.encode().unwrap()).await.unwrap();
        assert_eq!(engine.status(&b1.hash()), Some(BlockStatus::Verified));
        assert_eq!(engine.status(&b2.hash()), Some(BlockStatus::Verified));
        assert_eq!(snapshot(&engine).await, genesis);

        assert_eq!(engine.finalize_due(unix_now()).await.unwrap(), 2);
        assert_eq!(engine.status(&b2.hash()), Some(BlockStatus::Finalized));
        assert_eq!(snapshot(&engine).await, builder.grove().snapshot().unwrap());
        assert_eq!(engine.next_deadline(), None);
    }

    #[tokio::test]
    async fn test_wrong_root_invalidates_block_and_descendants() {
        let (mut engine, mut builder) = setup();
        let b1 = builder.build(body(1)).unwrap();
        let bad = builder
            .build_tampered(body(2), |header| header.utxo_root = Field::from_u64(12345))
            .unwrap();
        propose(&mut engine, &b1).await;
        propose(&mut engine, &bad).await;
        engine.on_fetched(b1.hash(), b1.encode().unwrap()).await.unwrap();
        let before = snapshot(&engine).await;

        engine.on_fetched(bad.hash(), bad.encode().unwrap()).await.unwrap();
        assert_eq!(engine.status(&bad.hash()), Some(BlockStatus::Invalidated));
        assert_eq!(snapshot(&engine).await, before);

        // only the honest block gets committed
        assert_eq!(engine.finalize_due(u64::MAX).await.unwrap(), 1);
        let stats = engine.stats();
        assert_eq!((stats.finalized, stats.invalidated), (1, 1));
    }

    #[tokio::test]
    async fn test_mismatched_body_is_invalid() {
        let (mut engine, mut builder) = setup();
        let b1 = builder.build(body(1)).unwrap();
        propose(&mut engine, &b1).await;
        engine.on_fetched(b1.hash(), b"garbage".to_vec()).await.unwrap();
        assert_eq!(engine.status(&b1.hash()), Some(BlockStatus::Invalidated));
    }

    #[tokio::test]
    async fn test_challenge_cancels_pending_finalization() {
        let (mut engine, mut builder) = setup();
        let blocks: Vec<Block> = (1..=3).map(|s| builder.build(body(s)).unwrap()).collect();
        for block in &blocks {
            propose(&mut engine, block).await;
            engine.on_fetched(block.hash(), block.encode().unwrap()).await.unwrap();
        }
        assert_eq!(engine.stats().verified, 3);
        let before = snapshot(&engine).await;

        assert_eq!(engine.on_challenged(blocks[1].hash()).await.unwrap(), 2);
        assert_eq!(engine.status(&blocks[2].hash()), Some(BlockStatus::Invalidated));
        assert_eq!(engine.finalize_due(u64::MAX).await.unwrap(), 1);
        assert_ne!(snapshot(&engine).await, before);
        assert_eq!(engine.status(&blocks[0].hash()), Some(BlockStatus::Finalized));

        assert!(matches!(
            engine.on_challenged(blocks[0].hash()).await,
            Err(SyncError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_reorg_reverts_and_slot_can_be_reproposed() {
        let (mut engine, mut builder) = setup();
        let b1 = builder.build(body(1)).unwrap();
        propose(&mut engine, &b1).await;
        engine.on_fetched(b1.hash(), b1.encode().unwrap()).await.unwrap();
        engine.finalize_due(u64::MAX).await.unwrap();

        let b2 = builder.build(body(2)).unwrap();
        propose(&mut engine, &b2).await;
        engine.on_fetched(b2.hash(), b2.encode().unwrap()).await.unwrap();
        let committed = snapshot(&engine).await;

        assert_eq!(engine.on_reorg(b2.hash()).await.unwrap(), 1);
        assert_eq!(engine.status(&b2.hash()), Some(BlockStatus::Reverted));
        assert_eq!(snapshot(&engine).await, committed);

        // an honest replacement for the same slot
        let (_, mut fresh_builder) = setup();
        fresh_builder.build(body(1)).unwrap();
        let replacement = fresh_builder.build(body(7)).unwrap();
        propose(&mut engine, &replacement).await;
        engine
            .on_fetched(replacement.hash(), replacement.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(engine.status(&replacement.hash()), Some(BlockStatus::Verified));
        assert_eq!(engine.finalize_due(u64::MAX).await.unwrap(), 1);
        assert_eq!(snapshot(&engine).await, fresh_builder.grove().snapshot().unwrap());

        assert!(matches!(
            engine.on_reorg(b1.hash()).await,
            Err(SyncError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_proposal_is_fatal() {
        let (mut engine, _) = setup();
        engine.on_proposed(Field::from_u64(1), 5, 0).await.unwrap();
        let err = engine.on_proposed(Field::from_u64(2), 7, 0).await.unwrap_err();
        assert!(matches!(err, SyncError::OutOfOrderBlock { expected: 6, got: 7 }));
        assert!(err.is_fatal());

        // duplicates are ignored
        engine.on_proposed(Field::from_u64(1), 5, 0).await.unwrap();
        assert_eq!(engine.records().count(), 1);
    }

    #[tokio::test]
    async fn test_finalizing_under_invalid_parent_is_fatal() {
        let (mut engine, mut builder) = setup();
        let b1 = builder.build(body(1)).unwrap();
        let b2 = builder.build(body(2)).unwrap();
        for block in [&b1, &b2] {
            propose(&mut engine, block).await;
            engine.on_fetched(block.hash(), block.encode().unwrap()).await.unwrap();
        }
        if let Some(parent) = engine.blocks.get_mut(&1) {
            parent.status = BlockStatus::Invalidated;
        }
        let err = engine.try_finalize(2).await.unwrap_err();
        assert!(matches!(err, SyncError::FinalizedAfterInvalidParent { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_fetch_missing_uses_source_and_reload_restores() {
        let (mut engine, mut builder) = setup();
        let b1 = builder.build(body(1)).unwrap();
        let b2 = builder.build(body(2)).unwrap();
        propose(&mut engine, &b1).await;
        propose(&mut engine, &b2).await;
        engine.source().add_block(b1.hash(), b1.encode().unwrap());

        assert_eq!(engine.fetch_missing().await.unwrap(), 1);
        assert_eq!(engine.source().requests(), vec![b1.hash(), b2.hash()]);
        assert_eq!(engine.status(&b1.hash()), Some(BlockStatus::Verified));
        assert_eq!(engine.status(&b2.hash()), Some(BlockStatus::NotFetched));

        let mut restarted = BlockLifecycle::new(
            engine.grove().clone(),
            Arc::new(MockBlockSource::new()),
            engine.config.clone(),
        );
        restarted.load().await.unwrap();
        let reloaded: Vec<BlockRecord> = restarted.records().cloned().collect();
        let live: Vec<BlockRecord> = engine.records().cloned().collect();
        assert_eq!(reloaded, live);
    }

    #[tokio::test]
    async fn test_run_loop_processes_events() {
        let (mut engine, mut builder) = setup();
        // deadlines only pass through explicit events
        engine.config.challenge_period_secs = 3600;
        let b1 = builder.build(body(1)).unwrap();
        let b2 = builder.build(body(2)).unwrap();

        let mut canonical = BlockBuilder::new(MemStoreAdapter::new(), grove_config()).unwrap();
        canonical.build(body(1)).unwrap();
        let replacement = canonical.build(body(9)).unwrap();

        let (sender, receiver) = event_channel(&engine.config);
        let handle = tokio::spawn(async move {
            let result = engine.run(receiver).await;
            (engine, result)
        });

        for block in [&b1, &b2] {
            let proposal_num = block.header.proposal_num;
            send_event(&sender, ChainEvent::Proposed { hash: block.hash(), proposal_num, l1_origin: 10 })
                .await
                .unwrap();
            send_event(&sender, ChainEvent::Fetched { hash: block.hash(), raw: block.encode().unwrap() })
                .await
                .unwrap();
        }
        send_event(&sender, ChainEvent::ChallengePeriodElapsed { hash: b1.hash() })
            .await
            .unwrap();
        send_event(&sender, ChainEvent::Reorged { hash: b2.hash() }).await.unwrap();
        // reorging a finalized block is rejected without stopping the loop
        send_event(&sender, ChainEvent::Reorged { hash: b1.hash() }).await.unwrap();
        // an unknown block is not fatal either
        send_event(&sender, ChainEvent::Challenged { hash: Field::from_u64(404) })
            .await
            .unwrap();

        send_event(&sender, ChainEvent::Proposed { hash: replacement.hash(), proposal_num: 2, l1_origin: 11 })
            .await
            .unwrap();
        send_event(&sender, ChainEvent::Fetched { hash: replacement.hash(), raw: replacement.encode().unwrap() })
            .await
            .unwrap();
        send_event(&sender, ChainEvent::ChallengePeriodElapsed { hash: replacement.hash() })
            .await
            .unwrap();
        drop(sender);

        let (engine, result) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(engine.status(&b1.hash()), Some(BlockStatus::Finalized));
        assert_eq!(engine.status(&replacement.hash()), Some(BlockStatus::Finalized));
        assert_eq!(engine.status(&b2.hash()), None);
        let stats = engine.stats();
        assert_eq!((stats.finalized, stats.reverted), (2, 0));
        assert_eq!(snapshot(&engine).await, canonical.grove().snapshot().unwrap());
        for nullifier in &b2.body.nullifiers {
            assert!(!engine.grove().read().await.is_nullified(nullifier).unwrap());
        }
    }
}
