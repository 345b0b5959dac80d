//! In-memory block tree index: validity ladder, skip-list ancestor lookup, median time
//! past, chain tx accounting and persistence.

pub mod blockindex;
pub mod flatfiles;
pub mod index;
pub mod median;
pub mod metrics;
pub mod skiplist;
pub mod status;
pub mod tree;
pub mod trust;

pub use blockindex::{BlockIndexNode, NodeId, NodeState};
pub use flatfiles::FlatFilePos;
pub use index::BlockIndexDb;
pub use status::{BlockStatus, BlockValidity, Invalidity, Verdict};
pub use tree::{BlockTree, BlockTreeError, ChainGuard, TreeReader};
pub use trust::ChainTrust;
