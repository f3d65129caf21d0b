//! Layer-1 reorgs and challenges: reverted blocks leave no trace and their
//! slots accept a different chain

use crate::test_utils::{TestConfig, TestUtils};
use anyhow::Result;
use grove_runtime::{Field, GrovePatch};
use grove_sync::{Block, BlockStatus, SyncError};
use tempfile::TempDir;

#[tokio::test]
async fn test_reorg_reverts_descendants_and_accepts_new_chain() -> Result<()> {
    TestUtils::init_logging();
    let config = TestConfig::new();
    let mut builder = config.create_builder()?;
    let blocks = (1..=3)
        .map(|seed| builder.build(TestUtils::body(seed)))
        .collect::<Result<Vec<Block>, SyncError>>()?;

    let mut engine = config.create_engine(config.create_mem_grove()?);
    for block in &blocks {
        engine.on_proposed(block.hash(), block.header.proposal_num, 0).await?;
        engine.on_fetched(block.hash(), block.encode()?).await?;
    }
    assert!(engine.try_finalize(1).await?);
    let after_first = engine.grove().read().await.snapshot()?;

    assert_eq!(engine.on_reorg(blocks[1].hash()).await?, 2);
    assert_eq!(engine.status(&blocks[1].hash()), Some(BlockStatus::Reverted));
    assert_eq!(engine.status(&blocks[2].hash()), Some(BlockStatus::Reverted));
    assert_eq!(engine.finalize_due(u64::MAX).await?, 0);
    assert_eq!(engine.grove().read().await.snapshot()?, after_first);

    // the canonical chain now continues with different blocks
    let mut canonical = config.create_builder()?;
    canonical.build(TestUtils::body(1))?;
    let replacements = [20, 21]
        .into_iter()
        .map(|seed| canonical.build(TestUtils::body(seed)))
        .collect::<Result<Vec<Block>, SyncError>>()?;
    for block in &replacements {
        engine.on_proposed(block.hash(), block.header.proposal_num, 1).await?;
        engine.on_fetched(block.hash(), block.encode()?).await?;
    }
    assert_eq!(engine.finalize_due(u64::MAX).await?, 2);
    assert_eq!(engine.stats().finalized, 3);
    assert_eq!(engine.grove().read().await.snapshot()?, canonical.grove().snapshot()?);
    assert_eq!(engine.record(&blocks[1].hash()), None);
    Ok(())
}

#[tokio::test]
async fn test_challenge_invalidates_block_and_descendants() -> Result<()> {
    let config = TestConfig::new();
    let mut builder = config.create_builder()?;
    let blocks = (1..=3)
        .map(|seed| builder.build(TestUtils::body(seed)))
        .collect::<Result<Vec<Block>, SyncError>>()?;

    let mut engine = config.create_engine(config.create_mem_grove()?);
    for block in &blocks {
        engine.on_proposed(block.hash(), block.header.proposal_num, 0).await?;
    }
    engine.on_fetched(blocks[0].hash(), blocks[0].encode()?).await?;
    engine.on_fetched(blocks[1].hash(), blocks[1].encode()?).await?;

    // the third block is challenged before its bytes show up
    assert_eq!(engine.on_challenged(blocks[1].hash()).await?, 2);
    assert_eq!(engine.status(&blocks[2].hash()), Some(BlockStatus::Invalidated));
    engine.on_fetched(blocks[2].hash(), blocks[2].encode()?).await?;
    assert_eq!(engine.status(&blocks[2].hash()), Some(BlockStatus::Invalidated));

    assert_eq!(engine.finalize_due(u64::MAX).await?, 1);
    let grove = engine.grove().read().await;
    for nullifier in blocks[1].body.nullifiers.iter().chain(&blocks[2].body.nullifiers) {
        assert!(!grove.is_nullified(nullifier)?);
    }
    for nullifier in &blocks[0].body.nullifiers {
        assert!(grove.is_nullified(nullifier)?);
    }
    Ok(())
}

#[test]
fn test_recovered_nullifiers_stay_recovered_after_reopen() -> Result<()> {
    TestUtils::init_logging();
    let config = TestConfig::new();
    let dir = TempDir::new()?;
    let block_hash = Field::from_u64(0xAB);
    let nullifiers = vec![Field::from_u64(5), Field::from_u64(6), Field::from_u64(7)];

    let empty_root = {
        let mut grove = config.create_rocks_grove(dir.path())?;
        let empty_root = grove.snapshot()?.nullifier_tree_root;
        grove.apply_patch(&GrovePatch {
            block_hash,
            utxos: TestUtils::items(1, 2),
            withdrawals: Vec::new(),
            nullifiers: nullifiers.clone(),
        })?;
        assert_eq!(grove.recover(&block_hash)?, 3);
        empty_root
    };

    let mut grove = config.create_rocks_grove(dir.path())?;
    assert_eq!(grove.snapshot()?.nullifier_tree_root, empty_root);
    for nullifier in &nullifiers {
        assert!(!grove.is_nullified(nullifier)?);
    }
    // nothing left to recover
    assert_eq!(grove.recover(&block_hash)?, 0);
    Ok(())
}
