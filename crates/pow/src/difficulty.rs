//! Difficulty and compact target utilities.

use blocktree_consensus::ConsensusParams;
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    if size <= 3 {
        word >>= 8 * (3 - size);
        return Ok(U256::from(word));
    }

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(U256::from(word) << (8 * (size - 3)))
}

/// Whether `bits` names a nonzero target no easier than the network's proof-of-work limit.
pub fn within_pow_limit(bits: u32, params: &ConsensusParams) -> Result<bool, CompactError> {
    let target = compact_to_u256(bits)?;
    Ok(!target.is_zero() && target <= U256::from_little_endian(&params.pow_limit))
}

/// Expected number of hashes needed to find a block at `bits`: 2^256 / (target + 1).
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    // 2^256 does not fit; (~target / (target + 1)) + 1 is equal.
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn work_to_bytes(work: U256) -> [u8; 32] {
    work.to_big_endian()
}

pub fn work_from_bytes(bytes: &[u8; 32]) -> U256 {
    U256::from_big_endian(bytes)
}
