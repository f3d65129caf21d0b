//! Concurrent proof collection for the proving pipeline
//!
//! Every request takes its own read lock on the forest, so lookups overlap
//! with each other but never with a commit. The first failure drops the
//! remaining requests.

use crate::engine::SharedGrove;
use crate::{SyncError, SyncResult};
use futures::future::try_join_all;
use grove_runtime::{Field, KeyValueStoreLike, MerkleProof, TreeKind};

async fn collect_proofs<T>(grove: &SharedGrove<T>, kind: TreeKind, leaves: &[Field]) -> SyncResult<Vec<MerkleProof>>
where
    T: KeyValueStoreLike + Send + Sync + 'static,
{
    let requests = leaves.iter().map(|leaf| {
        let grove = grove.clone();
        let leaf = *leaf;
        async move {
            let grove = grove.read().await;
            let proof = match kind {
                TreeKind::Withdrawal => grove.withdrawal_merkle_proof(&leaf),
                TreeKind::Nullifier => grove.nullifier_merkle_proof(&leaf),
                TreeKind::Utxo => grove.output_merkle_proof(&leaf),
            };
            proof.map_err(SyncError::from)
        }
    });
    try_join_all(requests).await
}

/// Inclusion proofs of `leaves` in the output trees, in request order
pub async fn collect_output_proofs<T>(grove: &SharedGrove<T>, leaves: &[Field]) -> SyncResult<Vec<MerkleProof>>
where
    T: KeyValueStoreLike + Send + Sync + 'static,
{
    collect_proofs(grove, TreeKind::Utxo, leaves).await
}

pub async fn collect_withdrawal_proofs<T>(grove: &SharedGrove<T>, leaves: &[Field]) -> SyncResult<Vec<MerkleProof>>
where
    T: KeyValueStoreLike + Send + Sync + 'static,
{
    collect_proofs(grove, TreeKind::Withdrawal, leaves).await
}

/// Spent/unspent proofs of `nullifiers` in the nullifier tree
pub async fn collect_nullifier_proofs<T>(grove: &SharedGrove<T>, nullifiers: &[Field]) -> SyncResult<Vec<MerkleProof>>
where
    T: KeyValueStoreLike + Send + Sync + 'static,
{
    collect_proofs(grove, TreeKind::Nullifier, nullifiers).await
}
