//! Chain-trust decisions driven by network parameters: minimum chain work and the
//! assume-valid shortcut for script checks.

use blocktree_consensus::{ConsensusParams, Hash256};
use blocktree_pow::difficulty::block_proof;
use primitive_types::U256;

use crate::blockindex::NodeId;
use crate::tree::{BlockTree, BlockTreeError, TreeReader};

/// Blocks buried under at least this much equivalent time may skip script checks.
pub const ASSUME_VALID_BURY_SECS: i64 = 60 * 60 * 24 * 7 * 2;

#[derive(Clone, Debug)]
pub struct ChainTrust {
    minimum_chain_work: U256,
    assume_valid: Option<Hash256>,
    pow_target_spacing: i64,
}

impl ChainTrust {
    pub fn new(params: &ConsensusParams) -> Self {
        Self {
            minimum_chain_work: U256::from_little_endian(&params.minimum_chain_work),
            assume_valid: params.assume_valid(),
            pow_target_spacing: params.pow_target_spacing,
        }
    }

    /// Overrides the network default; `None` turns the shortcut off.
    pub fn with_assume_valid(mut self, hash: Option<Hash256>) -> Self {
        self.assume_valid = hash;
        self
    }

    pub fn with_minimum_chain_work(mut self, work: U256) -> Self {
        self.minimum_chain_work = work;
        self
    }

    pub fn minimum_chain_work(&self) -> U256 {
        self.minimum_chain_work
    }

    pub fn assume_valid(&self) -> Option<Hash256> {
        self.assume_valid
    }

    pub fn meets_minimum_chain_work(&self, tree: &BlockTree, id: NodeId) -> Result<bool, BlockTreeError> {
        Ok(tree.reader()?.node(id)?.chain_work() >= self.minimum_chain_work)
    }

    /// Time the network would need at `tip`'s difficulty to produce the work between `from`
    /// and `to`. Negative when `from` carries more work; saturates at `i64::MAX`.
    pub fn proof_equivalent_time(
        &self,
        reader: &TreeReader<'_>,
        to: NodeId,
        from: NodeId,
        tip: NodeId,
    ) -> Result<i64, BlockTreeError> {
        let to_work = reader.node(to)?.chain_work();
        let from_work = reader.node(from)?.chain_work();
        let (diff, sign) = if to_work > from_work {
            (to_work - from_work, 1i64)
        } else {
            (from_work - to_work, -1i64)
        };
        let tip_proof = block_proof(reader.node(tip)?.bits())
            .map_err(|_| BlockTreeError::InvalidHeader("invalid difficulty target"))?;
        if tip_proof.is_zero() {
            return Ok(sign * i64::MAX);
        }
        let spacing = U256::from(self.pow_target_spacing.max(0) as u64);
        let time = diff.saturating_mul(spacing) / tip_proof;
        if time.bits() > 63 {
            return Ok(sign * i64::MAX);
        }
        Ok(sign * time.low_u64() as i64)
    }

    /// Whether script checks for `id` may be skipped: the assume-valid block is indexed and
    /// descends from `id`, the best header does too and carries the minimum chain work, and
    /// `id` is buried under more than two weeks of equivalent work.
    ///
    /// Reads the best header through the chain lock, so it must not be called while a
    /// `ChainGuard` is held.
    pub fn assumed_valid(&self, tree: &BlockTree, id: NodeId) -> Result<bool, BlockTreeError> {
        let Some(assume_valid) = self.assume_valid else {
            return Ok(false);
        };
        let Some(assumed) = tree.lookup(&assume_valid)? else {
            return Ok(false);
        };
        let Some(best) = tree.best_header()? else {
            return Ok(false);
        };

        let reader = tree.reader()?;
        if !reader.is_ancestor(id, assumed)? || !reader.is_ancestor(id, best)? {
            return Ok(false);
        }
        if reader.node(best)?.chain_work() < self.minimum_chain_work {
            return Ok(false);
        }
        Ok(self.proof_equivalent_time(&reader, best, id, best)? > ASSUME_VALID_BURY_SECS)
    }
}
