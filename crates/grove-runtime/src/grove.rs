//! The forest: output and withdrawal trees split in generations, plus the
//! nullifier tree, behind a single owner
//!
//! Every mutation runs inside a [`GroveSession`], an overlay of the committed
//! state and a pending [`StoreTransaction`]. Dry runs build a session and drop
//! it; committing methods build the same session, then write its transaction
//! in one batch and adopt its in-memory state. Both paths execute identical
//! code, so a dry result always equals the committed one.

use crate::append_tree::AppendOnlyTree;
use crate::config::{GroveConfig, GroveHashers};
use crate::error::{GroveError, GroveResult};
use crate::field::Field;
use crate::hasher::Hasher;
use crate::nullifier_tree::{NullifierTree, NULLIFIER_TREE};
use crate::proof::MerkleProof;
use crate::repo::{HaltRepo, LeafRepo, NullifierRepo, TreeGenerationRepo};
use crate::traits::KeyValueStoreLike;
use crate::transaction::{Staged, StoreTransaction};
use crate::types::{
    AppendResult, GrovePatch, GroveSnapshot, HaltRecord, Item, TreeData, TreeGeneration, TreeId,
    TreeKind, TreeMetadata,
};
use log::{debug, error, info};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashSet;

/// In-memory view of the committed generations and nullifier root
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GroveState {
    utxo: Vec<TreeGeneration>,
    withdrawal: Vec<TreeGeneration>,
    nullifier_root: Field,
}

impl GroveState {
    fn generations(&self, kind: TreeKind) -> &[TreeGeneration] {
        match kind {
            TreeKind::Utxo => &self.utxo,
            TreeKind::Withdrawal => &self.withdrawal,
            TreeKind::Nullifier => &[],
        }
    }

    fn generations_mut(&mut self, kind: TreeKind) -> &mut Vec<TreeGeneration> {
        match kind {
            TreeKind::Withdrawal => &mut self.withdrawal,
            _ => &mut self.utxo,
        }
    }

    fn snapshot(&self) -> GroveResult<GroveSnapshot> {
        let utxo = self.utxo.last().ok_or(GroveError::NotInitialized)?;
        let withdrawal = self.withdrawal.last().ok_or(GroveError::NotInitialized)?;
        Ok(GroveSnapshot {
            utxo_tree_index: utxo.global_next_index(),
            utxo_tree_root: utxo.data.root,
            withdrawal_tree_index: withdrawal.global_next_index(),
            withdrawal_tree_root: withdrawal.data.root,
            nullifier_tree_root: self.nullifier_root,
        })
    }
}

pub struct Grove<T: KeyValueStoreLike> {
    /// Locked so that a proof lookup can persist a halt marker
    store: RwLock<T>,
    config: GroveConfig,
    hashers: GroveHashers,
    state: Option<GroveState>,
    /// Generations whose proof cache disagreed with their stored root,
    /// mirrored under `grove:halted:`
    halted: RwLock<HashSet<TreeId>>,
    observed_pub_keys: HashSet<Vec<u8>>,
    observed_addresses: HashSet<Vec<u8>>,
}

impl<T: KeyValueStoreLike> Grove<T> {
    pub fn new(store: T, config: GroveConfig) -> GroveResult<Self> {
        config.validate()?;
        let hashers = GroveHashers::default_for(&config);
        Self::with_hashers(store, config, hashers)
    }

    /// Uses caller supplied hash functions; their depths must match `config`
    pub fn with_hashers(store: T, config: GroveConfig, hashers: GroveHashers) -> GroveResult<Self> {
        config.validate()?;
        for (name, hasher, depth) in [
            ("utxo", &hashers.utxo, config.utxo_tree_depth),
            ("withdrawal", &hashers.withdrawal, config.withdrawal_tree_depth),
            ("nullifier", &hashers.nullifier, config.nullifier_tree_depth),
        ] {
            if hasher.depth() != depth {
                return Err(GroveError::Config(format!(
                    "{} hasher built for depth {}, config says {}",
                    name,
                    hasher.depth(),
                    depth
                )));
            }
        }
        Ok(Self {
            store: RwLock::new(store),
            config,
            hashers,
            state: None,
            halted: RwLock::new(HashSet::new()),
            observed_pub_keys: HashSet::new(),
            observed_addresses: HashSet::new(),
        })
    }

    /// Loads every generation and the nullifier root, creating the genesis
    /// generations on an empty store
    pub fn init(&mut self) -> GroveResult<()> {
        let mut tx = StoreTransaction::new();
        let mut state = GroveState {
            utxo: Vec::new(),
            withdrawal: Vec::new(),
            nullifier_root: self.hashers.nullifier.empty_root(),
        };

        let store = self.store.read();
        for kind in [TreeKind::Utxo, TreeKind::Withdrawal] {
            let mut generations = TreeGenerationRepo::load_all(&Staged::direct(&*store), kind)?;
            if generations.is_empty() {
                let genesis = TreeGeneration {
                    metadata: TreeMetadata {
                        id: TreeId::new(kind, 0),
                        root_owner: None,
                        start: 0,
                        end: 0,
                    },
                    data: TreeData::empty(self.hasher(kind)),
                };
                TreeGenerationRepo::create(&*store, &mut tx, &genesis)?;
                info!("Created genesis {} tree", kind);
                generations.push(genesis);
            }
            *state.generations_mut(kind) = generations;
        }

        match NullifierRepo::root(&Staged::direct(&*store))? {
            Some(root) => state.nullifier_root = root,
            None => NullifierRepo::save_root(&mut tx, &state.nullifier_root),
        }

        let halts = HaltRepo::load_all(&*store)?;
        drop(store);
        {
            let mut halted = self.halted.write();
            for record in halts {
                error!("Tree {} stays halted: {}", record.tree, record.reason);
                halted.insert(record.tree);
            }
        }

        tx.commit(self.store.get_mut())?;
        info!(
            "Grove initialized: {} utxo and {} withdrawal generations",
            state.utxo.len(),
            state.withdrawal.len()
        );
        self.state = Some(state);
        Ok(())
    }

    fn state(&self) -> GroveResult<&GroveState> {
        self.state.as_ref().ok_or(GroveError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn config(&self) -> &GroveConfig {
        &self.config
    }

    pub fn store(&self) -> RwLockReadGuard<'_, T> {
        self.store.read()
    }

    pub fn hasher(&self, kind: TreeKind) -> &Hasher {
        match kind {
            TreeKind::Utxo => &self.hashers.utxo,
            TreeKind::Withdrawal => &self.hashers.withdrawal,
            TreeKind::Nullifier => &self.hashers.nullifier,
        }
    }

    fn append_tree(&self, kind: TreeKind) -> AppendOnlyTree<'_> {
        let subtree_size = match kind {
            TreeKind::Withdrawal => self.config.withdrawal_subtree_size,
            _ => self.config.utxo_subtree_size,
        };
        AppendOnlyTree::new(self.hasher(kind), subtree_size)
    }

    fn nullifier_tree(&self) -> NullifierTree<'_> {
        NullifierTree::new(&self.hashers.nullifier)
    }

    pub fn snapshot(&self) -> GroveResult<GroveSnapshot> {
        self.state()?.snapshot()
    }

    pub fn utxo_generations(&self) -> GroveResult<&[TreeGeneration]> {
        Ok(self.state()?.generations(TreeKind::Utxo))
    }

    pub fn withdrawal_generations(&self) -> GroveResult<&[TreeGeneration]> {
        Ok(self.state()?.generations(TreeKind::Withdrawal))
    }

    pub fn set_pub_keys_to_observe<I: IntoIterator<Item = Vec<u8>>>(&mut self, keys: I) {
        self.observed_pub_keys = keys.into_iter().collect();
    }

    pub fn set_addresses_to_observe<I: IntoIterator<Item = Vec<u8>>>(&mut self, addresses: I) {
        self.observed_addresses = addresses.into_iter().collect();
    }

    fn is_tracked(&self, kind: TreeKind, item: &Item) -> bool {
        if self.config.tracks_everything() {
            return true;
        }
        let observed = match kind {
            TreeKind::Withdrawal => &self.observed_addresses,
            _ => &self.observed_pub_keys,
        };
        item.note
            .as_ref()
            .is_some_and(|note| observed.contains(&note.owner))
    }

    pub fn is_halted(&self, tree: &TreeId) -> bool {
        self.halted.read().contains(tree)
    }

    fn ensure_writable(&self, tree: TreeId) -> GroveResult<()> {
        if self.is_halted(&tree) {
            return Err(GroveError::WritesHalted { tree });
        }
        Ok(())
    }

    /// Opens a dry session on top of the committed state
    pub fn simulate(&self) -> GroveResult<GroveSession<'_, T>> {
        Ok(GroveSession {
            grove: self,
            tx: StoreTransaction::new(),
            state: self.state()?.clone(),
        })
    }

    /// Writes a session's outcome and adopts its state
    fn commit_session(&mut self, tx: StoreTransaction, state: GroveState) -> GroveResult<()> {
        tx.commit(self.store.get_mut())?;
        self.state = Some(state);
        Ok(())
    }

    /// Commits writes that do not touch the forest, such as block records
    pub fn commit_staged(&mut self, tx: StoreTransaction) -> GroveResult<()> {
        tx.commit(self.store.get_mut())
    }

    /// Snapshot the forest would have after `patch`, without persisting it
    pub fn dry_patch(&self, patch: &GrovePatch) -> GroveResult<GroveSnapshot> {
        self.simulate()?.apply(patch)
    }

    pub fn apply_patch(&mut self, patch: &GrovePatch) -> GroveResult<GroveSnapshot> {
        self.apply_patch_with(patch, StoreTransaction::new())
    }

    /// Applies `patch` and commits `extra` in the same atomic batch
    pub fn apply_patch_with(
        &mut self,
        patch: &GrovePatch,
        extra: StoreTransaction,
    ) -> GroveResult<GroveSnapshot> {
        let mut session = self.simulate()?;
        let snapshot = session.apply(patch)?;
        let (mut tx, state) = session.into_parts();
        tx.merge(extra);
        self.commit_session(tx, state)?;
        info!(
            "Applied patch of block {}: utxo index {}, withdrawal index {}",
            patch.block_hash, snapshot.utxo_tree_index, snapshot.withdrawal_tree_index
        );
        Ok(snapshot)
    }

    pub fn dry_append_outputs(&self, items: &[Item]) -> GroveResult<AppendResult> {
        self.simulate()?.append(TreeKind::Utxo, items, None)
    }

    pub fn append_outputs(&mut self, items: &[Item]) -> GroveResult<AppendResult> {
        self.append_committed(TreeKind::Utxo, items)
    }

    pub fn dry_append_withdrawals(&self, items: &[Item]) -> GroveResult<AppendResult> {
        self.simulate()?.append(TreeKind::Withdrawal, items, None)
    }

    pub fn append_withdrawals(&mut self, items: &[Item]) -> GroveResult<AppendResult> {
        self.append_committed(TreeKind::Withdrawal, items)
    }

    fn append_committed(&mut self, kind: TreeKind, items: &[Item]) -> GroveResult<AppendResult> {
        let mut session = self.simulate()?;
        let result = session.append(kind, items, None)?;
        let (tx, state) = session.into_parts();
        self.commit_session(tx, state)?;
        Ok(result)
    }

    /// Spends `nullifiers` on behalf of `block_hash`, all or nothing, and
    /// returns the new nullifier root
    pub fn mark_nullified(&mut self, nullifiers: &[Field], block_hash: &Field) -> GroveResult<Field> {
        let mut session = self.simulate()?;
        session.nullify(nullifiers, block_hash)?;
        let (tx, state) = session.into_parts();
        let root = state.nullifier_root;
        self.commit_session(tx, state)?;
        Ok(root)
    }

    /// Undoes every nullification of `block_hash`
    pub fn recover(&mut self, block_hash: &Field) -> GroveResult<usize> {
        self.recover_with(std::slice::from_ref(block_hash), StoreTransaction::new())
    }

    /// Undoes the nullifications of several blocks, newest first, and
    /// commits `extra` in the same atomic batch
    pub fn recover_with(&mut self, block_hashes: &[Field], extra: StoreTransaction) -> GroveResult<usize> {
        let mut session = self.simulate()?;
        let mut reset = 0;
        for block_hash in block_hashes.iter().rev() {
            reset += session.recover(block_hash)?;
        }
        let (mut tx, state) = session.into_parts();
        tx.merge(extra);
        self.commit_session(tx, state)?;
        Ok(reset)
    }

    pub fn is_nullified(&self, nullifier: &Field) -> GroveResult<bool> {
        self.state()?;
        let store = self.store.read();
        self.nullifier_tree().is_nullified(&Staged::direct(&*store), nullifier)
    }

    pub fn output_merkle_proof(&self, leaf_hash: &Field) -> GroveResult<MerkleProof> {
        self.append_proof(TreeKind::Utxo, leaf_hash)
    }

    pub fn withdrawal_merkle_proof(&self, leaf_hash: &Field) -> GroveResult<MerkleProof> {
        self.append_proof(TreeKind::Withdrawal, leaf_hash)
    }

    fn append_proof(&self, kind: TreeKind, leaf_hash: &Field) -> GroveResult<MerkleProof> {
        let state = self.state()?;
        let proof = {
            let store = self.store.read();
            let reader = Staged::direct(&*store);
            let record = LeafRepo::get(&reader, kind, leaf_hash)?
                .ok_or(GroveError::LeafNotFound { leaf: *leaf_hash })?;
            let generation = state
                .generations(kind)
                .get(record.tree.generation as usize)
                .ok_or(GroveError::LeafNotFound { leaf: *leaf_hash })?;
            self.append_tree(kind)
                .merkle_proof_at(&reader, generation, record.index, *leaf_hash)
        };
        proof.map_err(|err| self.halt_on_mismatch(err))
    }

    pub fn nullifier_merkle_proof(&self, nullifier: &Field) -> GroveResult<MerkleProof> {
        let root = self.state()?.nullifier_root;
        let proof = {
            let store = self.store.read();
            self.nullifier_tree()
                .merkle_proof(&Staged::direct(&*store), root, nullifier)
        };
        proof.map_err(|err| self.halt_on_mismatch(err))
    }

    /// A mismatch on committed data means the cache is corrupt: stop writing
    /// to that generation, now and after a restart. Must be called with no
    /// store guard held.
    fn halt_on_mismatch(&self, err: GroveError) -> GroveError {
        let GroveError::RootMismatch { tree, .. } = &err else {
            return err;
        };
        error!("Halting writes to tree {}: {}", tree, err);
        if !self.halted.write().insert(*tree) {
            return err;
        }
        let record = HaltRecord {
            tree: *tree,
            reason: err.to_string(),
        };
        let mut tx = StoreTransaction::new();
        let persisted = HaltRepo::save(&mut tx, &record).and_then(|_| tx.commit(&mut *self.store.write()));
        if let Err(persist_err) = persisted {
            error!("Could not persist halt of tree {}: {}", tree, persist_err);
        }
        err
    }
}

/// Pending changes on top of a [`Grove`]; dropping the session discards them
pub struct GroveSession<'g, T: KeyValueStoreLike> {
    grove: &'g Grove<T>,
    tx: StoreTransaction,
    state: GroveState,
}

impl<'g, T: KeyValueStoreLike> GroveSession<'g, T> {
    pub fn snapshot(&self) -> GroveResult<GroveSnapshot> {
        self.state.snapshot()
    }

    /// Number of staged writes
    pub fn pending_writes(&self) -> usize {
        self.tx.len()
    }

    /// Applies a whole block: outputs, withdrawals, then nullifiers
    pub fn apply(&mut self, patch: &GrovePatch) -> GroveResult<GroveSnapshot> {
        self.append(TreeKind::Utxo, &patch.utxos, Some(patch.block_hash))?;
        self.append(TreeKind::Withdrawal, &patch.withdrawals, Some(patch.block_hash))?;
        self.nullify(&patch.nullifiers, &patch.block_hash)?;
        debug!(
            "Staged patch of block {}: {} utxos, {} withdrawals, {} nullifiers",
            patch.block_hash,
            patch.utxos.len(),
            patch.withdrawals.len(),
            patch.nullifiers.len()
        );
        self.state.snapshot()
    }

    /// Appends to the latest generation of `kind`, opening new generations
    /// (owned by `block_hash`) whenever the current one is full
    pub fn append(
        &mut self,
        kind: TreeKind,
        items: &[Item],
        block_hash: Option<Field>,
    ) -> GroveResult<AppendResult> {
        let grove = self.grove;
        if kind == TreeKind::Nullifier {
            return Err(GroveError::Config("nullifier tree is not append-only".to_string()));
        }
        let tree = grove.append_tree(kind);
        let tracked: Vec<bool> = items.iter().map(|item| grove.is_tracked(kind, item)).collect();

        let mut offset = 0;
        loop {
            let latest = self
                .state
                .generations(kind)
                .last()
                .cloned()
                .ok_or(GroveError::NotInitialized)?;
            grove.ensure_writable(latest.id())?;

            let free = tree.capacity() - latest.data.next_index;
            let remaining = items.len() - offset;
            if remaining > 0 && free == 0 {
                self.roll_generation(&latest, block_hash)?;
                continue;
            }

            let take = remaining.min(usize::try_from(free).unwrap_or(usize::MAX));
            let mut generation = latest;
            let appended = tree.append(
                &mut self.tx,
                &mut generation,
                &items[offset..offset + take],
                &tracked[offset..offset + take],
            )?;
            if let Some(slot) = self.state.generations_mut(kind).last_mut() {
                *slot = generation;
            }
            offset += take;
            if offset == items.len() {
                return Ok(appended);
            }
        }
    }

    fn roll_generation(&mut self, previous: &TreeGeneration, block_hash: Option<Field>) -> GroveResult<()> {
        let kind = previous.id().kind;
        let id = TreeId::new(kind, previous.id().generation + 1);
        let generation = TreeGeneration {
            metadata: TreeMetadata {
                id,
                root_owner: block_hash,
                start: previous.metadata.end,
                end: previous.metadata.end,
            },
            data: TreeData::empty(self.grove.hasher(kind)),
        };
        TreeGenerationRepo::create(&*self.grove.store.read(), &mut self.tx, &generation)?;
        info!(
            "Tree {} is full, opened generation {} at global index {}",
            previous.id(),
            id,
            generation.metadata.start
        );
        self.state.generations_mut(kind).push(generation);
        Ok(())
    }

    pub fn nullify(&mut self, nullifiers: &[Field], block_hash: &Field) -> GroveResult<()> {
        if nullifiers.is_empty() {
            return Ok(());
        }
        self.grove.ensure_writable(NULLIFIER_TREE)?;
        let tree = self.grove.nullifier_tree();
        let store = self.grove.store.read();
        for nullifier in nullifiers {
            tree.nullify(
                &*store,
                &mut self.tx,
                &mut self.state.nullifier_root,
                nullifier,
                block_hash,
            )?;
        }
        Ok(())
    }

    pub fn recover(&mut self, block_hash: &Field) -> GroveResult<usize> {
        self.grove.ensure_writable(NULLIFIER_TREE)?;
        let store = self.grove.store.read();
        self.grove.nullifier_tree().recover(
            &*store,
            &mut self.tx,
            &mut self.state.nullifier_root,
            block_hash,
        )
    }

    pub(crate) fn into_parts(self) -> (StoreTransaction, GroveState) {
        (self.tx, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{reference_root, TestStore};
    use crate::types::Note;

    fn small_config() -> GroveConfig {
        GroveConfig {
            utxo_tree_depth: 3,
            withdrawal_tree_depth: 4,
            nullifier_tree_depth: 16,
            utxo_subtree_size: 2,
            withdrawal_subtree_size: 1,
            ..Default::default()
        }
    }

    fn grove(config: GroveConfig) -> Grove<TestStore> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut grove = Grove::new(TestStore::default(), config).unwrap();
        grove.init().unwrap();
        grove
    }

    fn items(range: std::ops::Range<u64>) -> Vec<Item> {
        range.map(|v| Item::new(Field::from_u64(v))).collect()
    }

    #[test]
    fn test_uninitialized_grove_refuses_work() {
        let grove = Grove::new(TestStore::default(), small_config()).unwrap();
        assert!(matches!(grove.snapshot(), Err(GroveError::NotInitialized)));
        assert!(matches!(
            grove.dry_append_outputs(&items(1..2)),
            Err(GroveError::NotInitialized)
        ));
    }

    #[test]
    fn test_init_is_idempotent_across_restarts() {
        let mut grove = grove(small_config());
        grove.append_outputs(&items(1..4)).unwrap();
        let snapshot = grove.snapshot().unwrap();

        let mut reopened = Grove::new(grove.store().clone(), small_config()).unwrap();
        reopened.init().unwrap();
        assert_eq!(reopened.snapshot().unwrap(), snapshot);
        assert_eq!(reopened.utxo_generations().unwrap().len(), 1);
    }

    #[test]
    fn test_rollover_opens_new_generation() {
        let config = small_config();
        let mut grove = grove(config);
        let hasher = Hasher::sha256(3);

        // 7 items pad to 8: generation 0 is full
        grove.append_outputs(&items(100..107)).unwrap();
        let first_root = grove.snapshot().unwrap().utxo_tree_root;

        let mut session = grove.simulate().unwrap();
        session
            .append(TreeKind::Utxo, &items(200..203), Some(Field::from_u64(55)))
            .unwrap();
        let (tx, state) = session.into_parts();
        grove.commit_session(tx, state).unwrap();

        let generations = grove.utxo_generations().unwrap();
        assert_eq!(generations.len(), 2);
        assert_eq!(generations[0].data.root, first_root);
        assert_eq!(generations[1].metadata.root_owner, Some(Field::from_u64(55)));
        assert_eq!(generations[1].metadata.start, 8);
        assert_eq!(generations[1].data.next_index, 4);
        let leaves: Vec<Field> = (200..203).map(Field::from_u64).collect();
        assert_eq!(generations[1].data.root, reference_root(&hasher, &leaves));
        assert_eq!(grove.snapshot().unwrap().utxo_tree_index, 12);

        // proofs on the prior generation still verify
        let proof = grove.output_merkle_proof(&Field::from_u64(103)).unwrap();
        assert_eq!(proof.root, first_root);
        assert!(proof.verify(&hasher));
        let proof = grove.output_merkle_proof(&Field::from_u64(201)).unwrap();
        assert!(proof.verify(&hasher));
    }

    #[test]
    fn test_single_append_spanning_generations() {
        let mut grove = grove(small_config());
        grove.append_withdrawals(&items(1..21)).unwrap();
        let generations = grove.withdrawal_generations().unwrap();
        assert_eq!(generations.len(), 2);
        assert_eq!(generations[0].data.next_index, 16);
        assert_eq!(generations[1].data.next_index, 4);
        assert_eq!(grove.snapshot().unwrap().withdrawal_tree_index, 20);
    }

    #[test]
    fn test_dry_patch_equals_apply_patch() {
        let mut grove = grove(small_config());
        let patch = GrovePatch {
            block_hash: Field::from_u64(9000),
            utxos: items(1..4),
            withdrawals: items(50..52),
            nullifiers: vec![Field::from_u64(7), Field::from_u64(8)],
        };
        let store_before = grove.store().clone();
        let dry = grove.dry_patch(&patch).unwrap();
        assert_eq!(*grove.store(), store_before);

        let applied = grove.apply_patch(&patch).unwrap();
        assert_eq!(dry, applied);
        assert_eq!(grove.snapshot().unwrap(), applied);
        assert!(grove.is_nullified(&Field::from_u64(7)).unwrap());
    }

    #[test]
    fn test_failed_patch_leaves_no_trace() {
        let mut grove = grove(small_config());
        grove.mark_nullified(&[Field::from_u64(3)], &Field::from_u64(1)).unwrap();
        let before = grove.snapshot().unwrap();
        let store_before = grove.store().clone();

        let patch = GrovePatch {
            block_hash: Field::from_u64(2),
            utxos: items(1..3),
            withdrawals: vec![],
            nullifiers: vec![Field::from_u64(3)],
        };
        assert!(matches!(
            grove.apply_patch(&patch),
            Err(GroveError::DoubleNullification { .. })
        ));
        assert_eq!(grove.snapshot().unwrap(), before);
        assert_eq!(*grove.store(), store_before);
    }

    #[test]
    fn test_stacked_sessions_match_sequential_commits() {
        let mut grove = grove(small_config());
        let first = GrovePatch {
            block_hash: Field::from_u64(1),
            utxos: items(1..3),
            nullifiers: vec![Field::from_u64(11)],
            ..Default::default()
        };
        let second = GrovePatch {
            block_hash: Field::from_u64(2),
            utxos: items(3..5),
            nullifiers: vec![Field::from_u64(12)],
            ..Default::default()
        };

        let mut session = grove.simulate().unwrap();
        session.apply(&first).unwrap();
        let stacked = session.apply(&second).unwrap();
        drop(session);

        grove.apply_patch(&first).unwrap();
        assert_eq!(grove.apply_patch(&second).unwrap(), stacked);
    }

    #[test]
    fn test_partial_observation_skips_foreign_leaves() {
        let mut grove = grove(GroveConfig {
            full_sync: false,
            ..small_config()
        });
        let mine = vec![0xaa];
        grove.set_pub_keys_to_observe(vec![mine.clone()]);
        let note = |owner: Vec<u8>| Note {
            owner,
            payload: vec![],
        };
        let batch = vec![
            Item::with_note(Field::from_u64(1), note(vec![0xbb])),
            Item::with_note(Field::from_u64(2), note(mine)),
            Item::new(Field::from_u64(3)),
        ];
        grove.append_outputs(&batch).unwrap();

        assert!(grove.output_merkle_proof(&Field::from_u64(2)).unwrap().verify(&Hasher::sha256(3)));
        assert!(matches!(
            grove.output_merkle_proof(&Field::from_u64(1)),
            Err(GroveError::LeafNotFound { .. })
        ));
        assert!(matches!(
            grove.output_merkle_proof(&Field::from_u64(3)),
            Err(GroveError::LeafNotFound { .. })
        ));
    }

    #[test]
    fn test_corrupt_cache_halts_generation() {
        let mut grove = grove(small_config());
        grove.append_outputs(&items(1..3)).unwrap();
        let tree = TreeId::new(TreeKind::Utxo, 0);

        let mut tx = StoreTransaction::new();
        crate::proof_cache::ProofCache::new(tree, 3).put_nodes(
            &mut tx,
            [(0, ruint::aliases::U256::from(1u64), Field::from_u64(999))],
        );
        grove.commit_staged(tx).unwrap();

        let err = grove.output_merkle_proof(&Field::from_u64(1)).unwrap_err();
        assert!(matches!(err, GroveError::RootMismatch { .. }));
        assert!(grove.is_halted(&tree));
        let err = grove.append_outputs(&items(5..6)).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, GroveError::WritesHalted { .. }));
    }

    #[test]
    fn test_halt_survives_restart() {
        let mut grove = grove(small_config());
        grove.append_outputs(&items(1..3)).unwrap();
        let tree = TreeId::new(TreeKind::Utxo, 0);

        let mut tx = StoreTransaction::new();
        crate::proof_cache::ProofCache::new(tree, 3).put_nodes(
            &mut tx,
            [(0, ruint::aliases::U256::from(1u64), Field::from_u64(999))],
        );
        grove.commit_staged(tx).unwrap();
        assert!(matches!(
            grove.output_merkle_proof(&Field::from_u64(1)),
            Err(GroveError::RootMismatch { .. })
        ));

        // no write was attempted before the restart
        let mut reopened = Grove::new(grove.store().clone(), small_config()).unwrap();
        reopened.init().unwrap();
        assert!(reopened.is_halted(&tree));
        assert!(!reopened.is_halted(&TreeId::new(TreeKind::Withdrawal, 0)));
        assert!(matches!(
            reopened.append_outputs(&items(5..6)),
            Err(GroveError::WritesHalted { .. })
        ));
        assert!(reopened.append_withdrawals(&items(5..6)).is_ok());

        let halts = HaltRepo::load_all(&*reopened.store()).unwrap();
        assert_eq!(halts.len(), 1);
        assert_eq!(halts[0].tree, tree);
        assert!(halts[0].reason.contains("utxo"));
    }

    #[test]
    fn test_recover_through_grove() {
        let mut grove = grove(small_config());
        let empty = grove.snapshot().unwrap().nullifier_tree_root;
        let block = Field::from_u64(4242);
        let (a, b) = (Field::from_u64(0xa), Field::from_u64(0xb));
        grove.mark_nullified(&[a, b], &block).unwrap();
        assert_eq!(grove.recover(&block).unwrap(), 2);
        assert!(!grove.is_nullified(&a).unwrap());
        assert!(!grove.is_nullified(&b).unwrap());
        assert_eq!(grove.snapshot().unwrap().nullifier_tree_root, empty);

        let proof = grove.nullifier_merkle_proof(&a).unwrap();
        assert_eq!(proof.leaf, Field::zero());
        assert!(proof.verify(grove.hasher(TreeKind::Nullifier)));
    }
}
