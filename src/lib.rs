//! Grove test suite
//!
//! Cross-crate scenarios for the forest and the block lifecycle engine, run
//! against the in-memory and the RocksDB backends.

pub mod test_utils;

#[cfg(test)]
pub mod tests;

// Re-export test utilities for external use
pub use test_utils::{TestConfig, TestUtils};
