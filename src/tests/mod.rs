//! Cross-crate scenarios for the grove forest and the block lifecycle engine

pub mod reorg_test;
