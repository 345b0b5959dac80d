//! Block header type and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;

pub use block::BlockHeader;
pub use hash::{sha256, sha256d};
