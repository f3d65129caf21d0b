//! Block lifecycle state machine gating every mutation of the grove forest

pub mod engine;
pub mod error;
pub mod mock;
pub mod repo;
pub mod traits;
pub mod types;
pub mod witness;

pub use engine::*;
pub use error::*;
pub use repo::BlockRepo;
pub use traits::*;
pub use types::*;
pub use witness::*;
