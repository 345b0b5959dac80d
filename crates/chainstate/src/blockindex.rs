//! Block index nodes: the immutable per-header core and its lock-guarded progress record.

use blocktree_consensus::Hash256;
use blocktree_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::flatfiles::FlatFilePos;
use crate::status::BlockStatus;

/// Handle of a node in the block tree arena. Stays valid for the life of the tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index).ok().map(NodeId)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fields fixed when the header is linked into the tree. Readable without the chain lock
/// once the node is published.
#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    hash: Hash256,
    version: i32,
    merkle_root: Hash256,
    time: u32,
    bits: u32,
    nonce: u32,
    height: i32,
    prev: Option<NodeId>,
    pub(crate) skip: Option<NodeId>,
    chain_work: U256,
    time_max: u32,
    time_received: i64,
}

impl BlockIndexNode {
    pub(crate) fn new(
        header: &BlockHeader,
        height: i32,
        prev: Option<NodeId>,
        chain_work: U256,
        time_max: u32,
        time_received: i64,
    ) -> Self {
        Self {
            hash: header.hash(),
            version: header.version,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            height,
            prev,
            skip: None,
            chain_work,
            time_max,
            time_received,
        }
    }

    pub fn hash(&self) -> &Hash256 {
        &self.hash
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn merkle_root(&self) -> &Hash256 {
        &self.merkle_root
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn block_time(&self) -> i64 {
        i64::from(self.time)
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn prev(&self) -> Option<NodeId> {
        self.prev
    }

    pub fn skip(&self) -> Option<NodeId> {
        self.skip
    }

    /// Total expected hashes from the root up to and including this block.
    pub fn chain_work(&self) -> U256 {
        self.chain_work
    }

    /// Largest header time on the path from the root to this block.
    pub fn block_time_max(&self) -> i64 {
        i64::from(self.time_max)
    }

    pub(crate) fn raw_time_max(&self) -> u32 {
        self.time_max
    }

    /// A root that is not genesis: a trust anchor whose ancestors are not indexed.
    pub fn is_anchor(&self) -> bool {
        self.prev.is_none() && self.height > 0
    }

    pub fn header_received_time(&self) -> i64 {
        self.time_received
    }

    pub fn received_time_diff(&self) -> i64 {
        self.time_received - self.block_time()
    }
}

/// Progress fields of a node. Only reachable through a held chain lock.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeState {
    pub status: BlockStatus,
    pub file_id: u32,
    pub data_offset: u32,
    pub undo_offset: u32,
    /// Transactions in this block; nonzero once the block reached `Transactions`.
    pub tx_count: u32,
    pub size: u32,
    /// Transactions from the root up to this block; zero until every ancestor has data.
    pub chain_tx: u64,
    /// Arrival order used to break ties between equal-work chains.
    pub sequence_id: i32,
}

impl NodeState {
    pub fn block_pos(&self) -> Option<FlatFilePos> {
        self.status
            .has_data()
            .then(|| FlatFilePos::new(self.file_id, self.data_offset))
    }

    pub fn undo_pos(&self) -> Option<FlatFilePos> {
        self.status
            .has_undo()
            .then(|| FlatFilePos::new(self.file_id, self.undo_offset))
    }

    pub fn have_num_chain_txs(&self) -> bool {
        self.chain_tx != 0
    }
}
