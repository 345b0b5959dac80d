//! Consensus-wide constants shared by the block tree.

/// Number of ancestor timestamps (including the block itself) feeding median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Serialized size of a block header.
pub const BLOCK_HEADER_SIZE: usize = 80;
