//! The block tree: an append-only arena of index nodes plus the chain lock that guards
//! every node's progress record.
//!
//! Lock order is chain lock, then the node vector, then the hash map. A [`TreeReader`] only
//! holds the node vector, so never take the chain lock while a reader is alive.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use blocktree_consensus::{hash256_to_hex, Hash256};
use blocktree_pow::difficulty::block_proof;
use blocktree_primitives::block::BlockHeader;
use blocktree_storage::StoreError;
use primitive_types::U256;

use crate::blockindex::{BlockIndexNode, NodeId, NodeState};
use crate::flatfiles::FlatFilePos;
use crate::median;
use crate::metrics::TreeMetrics;
use crate::skiplist;
use crate::status::{BlockStatus, BlockValidity};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockTreeError {
    LockPoisoned(&'static str),
    UnknownNode(NodeId),
    MissingPrev(Hash256),
    DuplicateRoot(Hash256),
    /// A walk above its target reached a node without a predecessor.
    BrokenLink {
        height: i32,
    },
    /// A link led to a node whose height does not match the link's target.
    CorruptLink {
        expected: i32,
        found: i32,
    },
    MissingData(NodeId),
    NotAnAnchor(NodeId),
    InvalidTxCount(NodeId),
    /// The block's transactions were already received with a different count.
    AlreadyReceived(NodeId),
    ArenaFull,
    HeightOverflow,
    InvalidHeader(&'static str),
    Store(StoreError),
    CorruptIndex(String),
}

impl std::fmt::Display for BlockTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockTreeError::LockPoisoned(name) => write!(f, "{name} lock poisoned"),
            BlockTreeError::UnknownNode(id) => write!(f, "unknown block index node {id}"),
            BlockTreeError::MissingPrev(hash) => {
                write!(f, "previous block {} not found", hash256_to_hex(hash))
            }
            BlockTreeError::DuplicateRoot(hash) => write!(
                f,
                "block {} has no predecessor but genesis is already indexed",
                hash256_to_hex(hash)
            ),
            BlockTreeError::BrokenLink { height } => {
                write!(f, "no predecessor below height {height}")
            }
            BlockTreeError::CorruptLink { expected, found } => write!(
                f,
                "tree link expected height {expected} but reached height {found}"
            ),
            BlockTreeError::MissingData(id) => write!(f, "block {id} has no stored data"),
            BlockTreeError::NotAnAnchor(id) => write!(f, "block {id} is not a trust anchor"),
            BlockTreeError::InvalidTxCount(id) => {
                write!(f, "block {id} reported an invalid transaction count")
            }
            BlockTreeError::AlreadyReceived(id) => {
                write!(f, "block {id} already received a different transaction count")
            }
            BlockTreeError::ArenaFull => write!(f, "block tree arena is full"),
            BlockTreeError::HeightOverflow => write!(f, "block height overflow"),
            BlockTreeError::InvalidHeader(message) => write!(f, "{message}"),
            BlockTreeError::Store(err) => write!(f, "{err}"),
            BlockTreeError::CorruptIndex(message) => write!(f, "corrupt block index: {message}"),
        }
    }
}

impl std::error::Error for BlockTreeError {}

impl From<StoreError> for BlockTreeError {
    fn from(err: StoreError) -> Self {
        BlockTreeError::Store(err)
    }
}

#[derive(Debug, Default)]
struct ChainRecords {
    /// Indexed by `NodeId`, parallel to the node vector.
    states: Vec<NodeState>,
    genesis: Option<NodeId>,
    best_header: Option<NodeId>,
    /// Blocks with transactions whose predecessor has no chain tx count yet.
    unlinked: HashMap<NodeId, Vec<NodeId>>,
    /// True predecessor hashes of trust anchors, which are not indexed themselves.
    anchor_parents: HashMap<NodeId, Hash256>,
    dirty: BTreeSet<NodeId>,
}

#[derive(Debug, Default)]
pub struct BlockTree {
    chain: Mutex<ChainRecords>,
    nodes: RwLock<Vec<BlockIndexNode>>,
    by_hash: RwLock<HashMap<Hash256, NodeId>>,
    metrics: TreeMetrics,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the chain lock. The lock is not reentrant: while the returned guard lives,
    /// use its methods rather than the `BlockTree` helpers that lock internally.
    pub fn lock(&self) -> Result<ChainGuard<'_>, BlockTreeError> {
        let records = self
            .chain
            .lock()
            .map_err(|_| BlockTreeError::LockPoisoned("chain"))?;
        Ok(ChainGuard {
            tree: self,
            records,
        })
    }

    pub fn reader(&self) -> Result<TreeReader<'_>, BlockTreeError> {
        Ok(TreeReader {
            nodes: self.read_nodes()?,
            metrics: &self.metrics,
        })
    }

    pub fn insert_header(
        &self,
        header: &BlockHeader,
        time_received: i64,
        sequence_id: i32,
    ) -> Result<NodeId, BlockTreeError> {
        self.lock()?
            .insert_header(header, time_received, sequence_id)
    }

    pub fn insert_anchor(
        &self,
        header: &BlockHeader,
        height: i32,
        chain_work: U256,
        time_received: i64,
    ) -> Result<NodeId, BlockTreeError> {
        self.lock()?
            .insert_anchor(header, height, chain_work, time_received)
    }

    pub fn lookup(&self, hash: &Hash256) -> Result<Option<NodeId>, BlockTreeError> {
        Ok(self.read_index()?.get(hash).copied())
    }

    pub fn len(&self) -> Result<usize, BlockTreeError> {
        Ok(self.read_nodes()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, BlockTreeError> {
        Ok(self.len()? == 0)
    }

    /// Takes the chain lock; must not be called while a [`ChainGuard`] is held.
    pub fn genesis(&self) -> Result<Option<NodeId>, BlockTreeError> {
        Ok(self.lock()?.genesis())
    }

    /// Takes the chain lock; must not be called while a [`ChainGuard`] is held. Use
    /// [`ChainGuard::best_header`] there instead.
    pub fn best_header(&self) -> Result<Option<NodeId>, BlockTreeError> {
        Ok(self.lock()?.best_header())
    }

    pub fn metrics(&self) -> &TreeMetrics {
        &self.metrics
    }

    fn read_nodes(&self) -> Result<RwLockReadGuard<'_, Vec<BlockIndexNode>>, BlockTreeError> {
        self.nodes
            .read()
            .map_err(|_| BlockTreeError::LockPoisoned("block tree nodes"))
    }

    fn write_nodes(&self) -> Result<RwLockWriteGuard<'_, Vec<BlockIndexNode>>, BlockTreeError> {
        self.nodes
            .write()
            .map_err(|_| BlockTreeError::LockPoisoned("block tree nodes"))
    }

    fn read_index(&self) -> Result<RwLockReadGuard<'_, HashMap<Hash256, NodeId>>, BlockTreeError> {
        self.by_hash
            .read()
            .map_err(|_| BlockTreeError::LockPoisoned("block hash index"))
    }

    fn write_index(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<Hash256, NodeId>>, BlockTreeError> {
        self.by_hash
            .write()
            .map_err(|_| BlockTreeError::LockPoisoned("block hash index"))
    }
}

/// Whether `candidate` lies at or below `ancestor`, which sits at `height`.
fn descends_from(
    nodes: &[BlockIndexNode],
    candidate: NodeId,
    ancestor: NodeId,
    height: i32,
) -> Result<bool, BlockTreeError> {
    match skiplist::ancestor(nodes, candidate, height) {
        Ok(found) => Ok(found == Some(ancestor)),
        Err(BlockTreeError::BrokenLink { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Read-only view of the immutable node fields. Holds the node vector's read lock.
pub struct TreeReader<'a> {
    nodes: RwLockReadGuard<'a, Vec<BlockIndexNode>>,
    metrics: &'a TreeMetrics,
}

impl TreeReader<'_> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&BlockIndexNode, BlockTreeError> {
        skiplist::node(&self.nodes, id)
    }

    pub fn nodes(&self) -> &[BlockIndexNode] {
        &self.nodes
    }

    /// Rebuilds the header, using a null predecessor hash for roots.
    pub fn block_header(&self, id: NodeId) -> Result<BlockHeader, BlockTreeError> {
        let node = self.node(id)?;
        let prev_block = match node.prev() {
            Some(prev) => *self.node(prev)?.hash(),
            None => [0u8; 32],
        };
        Ok(BlockHeader {
            version: node.version(),
            prev_block,
            merkle_root: *node.merkle_root(),
            time: node.time(),
            bits: node.bits(),
            nonce: node.nonce(),
        })
    }

    /// Ancestor of `id` at `height`; `None` when `height` is outside `[0, height(id)]`.
    pub fn ancestor(&self, id: NodeId, height: i32) -> Result<Option<NodeId>, BlockTreeError> {
        let walk = skiplist::walk(&self.nodes, id, height)?;
        self.metrics.record_ancestor(walk.hops);
        Ok(walk.found)
    }

    pub fn median_time_past(&self, id: NodeId) -> Result<i64, BlockTreeError> {
        self.metrics.record_median();
        median::median_time_past(&self.nodes, id)
    }

    pub fn is_ancestor(&self, ancestor: NodeId, of: NodeId) -> Result<bool, BlockTreeError> {
        let height = self.node(ancestor)?.height();
        descends_from(&self.nodes, of, ancestor, height)
    }

    /// Deepest node both `a` and `b` descend from; `None` when they hang off different roots.
    pub fn last_common_ancestor(
        &self,
        a: NodeId,
        b: NodeId,
    ) -> Result<Option<NodeId>, BlockTreeError> {
        let height = self.node(a)?.height().min(self.node(b)?.height());
        let mut left = match self.aligned(a, height)? {
            Some(id) => id,
            None => return Ok(None),
        };
        let mut right = match self.aligned(b, height)? {
            Some(id) => id,
            None => return Ok(None),
        };
        while left != right {
            match (self.node(left)?.prev(), self.node(right)?.prev()) {
                (Some(next_left), Some(next_right)) => {
                    left = next_left;
                    right = next_right;
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(left))
    }

    fn aligned(&self, id: NodeId, height: i32) -> Result<Option<NodeId>, BlockTreeError> {
        match self.ancestor(id, height) {
            Err(BlockTreeError::BrokenLink { .. }) => Ok(None),
            other => other,
        }
    }

    pub fn describe(&self, id: NodeId) -> Result<String, BlockTreeError> {
        let node = self.node(id)?;
        let prev = node
            .prev()
            .map(|prev| prev.to_string())
            .unwrap_or_else(|| "none".to_string());
        Ok(format!(
            "BlockIndexNode(prev={prev}, height={}, merkle={}, hash={})",
            node.height(),
            hash256_to_hex(node.merkle_root()),
            hash256_to_hex(node.hash())
        ))
    }
}

/// Proof of holding the chain lock. Every progress field is read and written through it.
pub struct ChainGuard<'a> {
    tree: &'a BlockTree,
    records: MutexGuard<'a, ChainRecords>,
}

impl<'a> ChainGuard<'a> {
    pub fn reader(&self) -> Result<TreeReader<'a>, BlockTreeError> {
        self.tree.reader()
    }

    pub fn genesis(&self) -> Option<NodeId> {
        self.records.genesis
    }

    pub fn best_header(&self) -> Option<NodeId> {
        self.records.best_header
    }

    /// Links a header under its predecessor, or makes it the genesis root when its
    /// predecessor hash is null. Known headers return their existing handle.
    pub fn insert_header(
        &mut self,
        header: &BlockHeader,
        time_received: i64,
        sequence_id: i32,
    ) -> Result<NodeId, BlockTreeError> {
        let tree = self.tree;
        let hash = header.hash();
        if let Some(id) = tree.lookup(&hash)? {
            return Ok(id);
        }

        let prev = if header.has_prev() {
            let prev = tree
                .lookup(&header.prev_block)?
                .ok_or(BlockTreeError::MissingPrev(header.prev_block))?;
            Some(prev)
        } else {
            if self.records.genesis.is_some() {
                return Err(BlockTreeError::DuplicateRoot(hash));
            }
            None
        };
        let proof = block_proof(header.bits)
            .map_err(|_| BlockTreeError::InvalidHeader("invalid difficulty target"))?;

        let (id, chain_work) = {
            let mut nodes = tree.write_nodes()?;
            let (height, chain_work, time_max) = match prev {
                Some(prev) => {
                    let parent = skiplist::node(&nodes, prev)?;
                    let height = parent
                        .height()
                        .checked_add(1)
                        .ok_or(BlockTreeError::HeightOverflow)?;
                    (
                        height,
                        parent.chain_work().saturating_add(proof),
                        parent.raw_time_max().max(header.time),
                    )
                }
                None => (0, proof, header.time),
            };
            let id = NodeId::from_index(nodes.len()).ok_or(BlockTreeError::ArenaFull)?;
            let mut node =
                BlockIndexNode::new(header, height, prev, chain_work, time_max, time_received);
            node.skip = skiplist::build_skip(&nodes, prev, height)?;
            nodes.push(node);
            (id, chain_work)
        };
        tree.write_index()?.insert(hash, id);

        let mut status = BlockStatus::new().with_validity(BlockValidity::Tree);
        if let Some(prev) = prev {
            if self.state(prev)?.status.is_invalid() {
                status = status.with_failed_parent();
            }
        } else {
            self.records.genesis = Some(id);
        }
        self.records.states.push(NodeState {
            status,
            sequence_id,
            ..NodeState::default()
        });
        self.records.dirty.insert(id);
        if !status.is_invalid() {
            self.consider_best_header(id, chain_work)?;
        }
        tree.metrics.record_header();

        blocktree_log::log_debug!(
            "Indexed header {} as {} (prev {})",
            hash256_to_hex(&hash),
            id,
            prev.map(|prev| prev.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(id)
    }

    /// Adds a root whose ancestry is trusted rather than indexed, such as a snapshot base.
    /// A header whose predecessor is already indexed must go through `insert_header`.
    pub fn insert_anchor(
        &mut self,
        header: &BlockHeader,
        height: i32,
        chain_work: U256,
        time_received: i64,
    ) -> Result<NodeId, BlockTreeError> {
        let tree = self.tree;
        let hash = header.hash();
        if let Some(id) = tree.lookup(&hash)? {
            return Ok(id);
        }
        if height < 1 {
            return Err(BlockTreeError::InvalidHeader(
                "trust anchor must sit above genesis",
            ));
        }
        if header.has_prev() && tree.lookup(&header.prev_block)?.is_some() {
            return Err(BlockTreeError::InvalidHeader(
                "trust anchor predecessor is already indexed",
            ));
        }

        let id = {
            let mut nodes = tree.write_nodes()?;
            let id = NodeId::from_index(nodes.len()).ok_or(BlockTreeError::ArenaFull)?;
            nodes.push(BlockIndexNode::new(
                header,
                height,
                None,
                chain_work,
                header.time,
                time_received,
            ));
            id
        };
        tree.write_index()?.insert(hash, id);

        self.records.states.push(NodeState {
            status: BlockStatus::new().with_validity(BlockValidity::Tree),
            ..NodeState::default()
        });
        if header.has_prev() {
            self.records.anchor_parents.insert(id, header.prev_block);
        }
        self.records.dirty.insert(id);
        self.consider_best_header(id, chain_work)?;
        tree.metrics.record_anchor();

        blocktree_log::log_info!(
            "Indexed trust anchor {} at height {}",
            hash256_to_hex(&hash),
            height
        );
        Ok(id)
    }

    pub fn state(&self, id: NodeId) -> Result<&NodeState, BlockTreeError> {
        self.records
            .states
            .get(id.index())
            .ok_or(BlockTreeError::UnknownNode(id))
    }

    fn state_mut(&mut self, id: NodeId) -> Result<&mut NodeState, BlockTreeError> {
        self.records
            .states
            .get_mut(id.index())
            .ok_or(BlockTreeError::UnknownNode(id))
    }

    pub fn status(&self, id: NodeId) -> Result<BlockStatus, BlockTreeError> {
        Ok(self.state(id)?.status)
    }

    pub fn block_pos(&self, id: NodeId) -> Result<Option<FlatFilePos>, BlockTreeError> {
        Ok(self.state(id)?.block_pos())
    }

    pub fn undo_pos(&self, id: NodeId) -> Result<Option<FlatFilePos>, BlockTreeError> {
        Ok(self.state(id)?.undo_pos())
    }

    pub fn chain_tx(&self, id: NodeId) -> Result<u64, BlockTreeError> {
        Ok(self.state(id)?.chain_tx)
    }

    /// True once every block back to the root has had its transactions received. Says
    /// nothing about script validity or whether the data is still stored.
    pub fn have_num_chain_txs(&self, id: NodeId) -> Result<bool, BlockTreeError> {
        Ok(self.state(id)?.have_num_chain_txs())
    }

    pub fn tx_count(&self, id: NodeId) -> Result<u32, BlockTreeError> {
        Ok(self.state(id)?.tx_count)
    }

    pub fn size(&self, id: NodeId) -> Result<u32, BlockTreeError> {
        Ok(self.state(id)?.size)
    }

    pub fn sequence_id(&self, id: NodeId) -> Result<i32, BlockTreeError> {
        Ok(self.state(id)?.sequence_id)
    }

    pub fn is_valid(&self, id: NodeId, up_to: BlockValidity) -> Result<bool, BlockTreeError> {
        Ok(self.state(id)?.status.is_valid(up_to))
    }

    /// Raises the validity level. Returns false, changing nothing, when the block is
    /// invalid or already at `up_to` or above.
    pub fn raise_validity(
        &mut self,
        id: NodeId,
        up_to: BlockValidity,
    ) -> Result<bool, BlockTreeError> {
        let state = self.state_mut(id)?;
        let status = state.status;
        if status.is_invalid() || status.validity() >= up_to {
            return Ok(false);
        }
        state.status = status.with_validity(up_to);
        self.records.dirty.insert(id);
        Ok(true)
    }

    pub fn set_block_data(&mut self, id: NodeId, pos: FlatFilePos) -> Result<(), BlockTreeError> {
        let state = self.state_mut(id)?;
        state.status = state.status.with_data();
        state.file_id = pos.file_id;
        state.data_offset = pos.offset;
        self.records.dirty.insert(id);
        Ok(())
    }

    /// Records undo data, which lives in the same file number as the block data.
    pub fn set_undo_data(&mut self, id: NodeId, undo_offset: u32) -> Result<(), BlockTreeError> {
        let state = self.state_mut(id)?;
        if !state.status.has_data() {
            return Err(BlockTreeError::MissingData(id));
        }
        state.status = state.status.with_undo();
        state.undo_offset = undo_offset;
        self.records.dirty.insert(id);
        Ok(())
    }

    /// Forgets where block and undo data were stored. Counts and chain tx stay intact.
    pub fn prune_block_data(&mut self, id: NodeId) -> Result<bool, BlockTreeError> {
        let state = self.state_mut(id)?;
        if !state.status.has_data() && !state.status.has_undo() {
            return Ok(false);
        }
        state.status = state.status.without_data();
        state.file_id = 0;
        state.data_offset = 0;
        state.undo_offset = 0;
        self.records.dirty.insert(id);
        Ok(true)
    }

    /// Records a fully received block and links chain tx counts. Returns every block whose
    /// chain tx count became known, starting with `id` itself when it could be linked.
    ///
    /// Receiving a block again, as after pruning, only refreshes its locator; the count must
    /// match the first one.
    pub fn received_transactions(
        &mut self,
        id: NodeId,
        tx_count: u32,
        size: u32,
        pos: FlatFilePos,
    ) -> Result<Vec<NodeId>, BlockTreeError> {
        if tx_count == 0 {
            return Err(BlockTreeError::InvalidTxCount(id));
        }
        let state = self.state_mut(id)?;
        if state.tx_count != 0 {
            if state.tx_count != tx_count {
                return Err(BlockTreeError::AlreadyReceived(id));
            }
            self.set_block_data(id, pos)?;
            return Ok(Vec::new());
        }
        state.tx_count = tx_count;
        state.size = size;
        state.file_id = pos.file_id;
        state.data_offset = pos.offset;
        state.status = state.status.with_data();
        self.raise_validity(id, BlockValidity::Transactions)?;
        self.records.dirty.insert(id);

        let linked = self.connect_chain_tx(id)?;
        self.tree.metrics.record_chain_tx_linked(linked.len());
        Ok(linked)
    }

    /// Seeds the chain tx count of a trust anchor and links descendants waiting on it.
    pub fn set_anchor_chain_tx(
        &mut self,
        id: NodeId,
        chain_tx: u64,
    ) -> Result<Vec<NodeId>, BlockTreeError> {
        let tree = self.tree;
        if !tree.reader()?.node(id)?.is_anchor() {
            return Err(BlockTreeError::NotAnAnchor(id));
        }
        if chain_tx == 0 {
            return Err(BlockTreeError::InvalidTxCount(id));
        }
        self.state_mut(id)?.chain_tx = chain_tx;
        self.records.dirty.insert(id);

        let linked = self.propagate_chain_tx(id)?;
        tree.metrics.record_chain_tx_linked(linked.len());
        Ok(linked)
    }

    /// Computes the chain tx count of `id` if its predecessor's is known, otherwise parks it
    /// until the predecessor links.
    pub(crate) fn connect_chain_tx(&mut self, id: NodeId) -> Result<Vec<NodeId>, BlockTreeError> {
        let tree = self.tree;
        let (prev, is_anchor) = {
            let reader = tree.reader()?;
            let node = reader.node(id)?;
            (node.prev(), node.is_anchor())
        };
        let state = self.state(id)?;
        let own = u64::from(state.tx_count);
        if own == 0 && !is_anchor {
            return Ok(Vec::new());
        }

        let chain_tx = match prev {
            None if is_anchor => {
                if state.chain_tx == 0 {
                    return Ok(Vec::new());
                }
                state.chain_tx
            }
            None => own,
            Some(prev) => {
                let prev_chain_tx = self.state(prev)?.chain_tx;
                if prev_chain_tx == 0 {
                    let waiting = self.records.unlinked.entry(prev).or_default();
                    if !waiting.contains(&id) {
                        waiting.push(id);
                    }
                    return Ok(Vec::new());
                }
                prev_chain_tx.saturating_add(own)
            }
        };
        self.state_mut(id)?.chain_tx = chain_tx;

        let mut linked = vec![id];
        linked.extend(self.propagate_chain_tx(id)?);
        Ok(linked)
    }

    fn propagate_chain_tx(&mut self, root: NodeId) -> Result<Vec<NodeId>, BlockTreeError> {
        let mut linked = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(parent) = queue.pop_front() {
            let Some(children) = self.records.unlinked.remove(&parent) else {
                continue;
            };
            let parent_chain_tx = self.state(parent)?.chain_tx;
            for child in children {
                let state = self.state_mut(child)?;
                state.chain_tx = parent_chain_tx.saturating_add(u64::from(state.tx_count));
                linked.push(child);
                queue.push_back(child);
            }
        }
        Ok(linked)
    }

    /// Flags `id` as failed and every known descendant as descending from a failed block.
    /// Returns the number of descendants newly marked.
    pub fn mark_failed(&mut self, id: NodeId) -> Result<usize, BlockTreeError> {
        let tree = self.tree;
        let reader = tree.reader()?;
        let height = reader.node(id)?.height();

        let state = self.state_mut(id)?;
        state.status = state.status.with_failed();
        self.records.dirty.insert(id);

        let mut marked = 0usize;
        for index in 0..reader.len() {
            let candidate = NodeId::from_index(index).ok_or(BlockTreeError::ArenaFull)?;
            if candidate == id || reader.nodes()[index].height() <= height {
                continue;
            }
            if !descends_from(reader.nodes(), candidate, id, height)? {
                continue;
            }
            let state = self.state_mut(candidate)?;
            if state.status.is_invalid() {
                continue;
            }
            state.status = state.status.with_failed_parent();
            self.records.dirty.insert(candidate);
            marked += 1;
        }

        self.refresh_best_header(reader.nodes())?;
        tree.metrics.record_invalidation();
        blocktree_log::log_warn!(
            "Marked block {} at height {} failed, {} descendants invalidated",
            hash256_to_hex(reader.node(id)?.hash()),
            height,
            marked
        );
        Ok(marked)
    }

    /// Flags a single block as descending from a failed block. Returns false if it was
    /// already invalid.
    pub fn mark_failed_parent(&mut self, id: NodeId) -> Result<bool, BlockTreeError> {
        let state = self.state_mut(id)?;
        if state.status.is_invalid() {
            return Ok(false);
        }
        state.status = state.status.with_failed_parent();
        self.records.dirty.insert(id);
        if self.records.best_header == Some(id) {
            let tree = self.tree;
            let reader = tree.reader()?;
            self.refresh_best_header(reader.nodes())?;
        }
        Ok(true)
    }

    /// Candidate preference: more chain work first, then earlier arrival, then earlier
    /// insertion. `Greater` means `a` is preferred.
    pub fn work_ordering(&self, a: NodeId, b: NodeId) -> Result<Ordering, BlockTreeError> {
        let reader = self.tree.reader()?;
        let work_a = reader.node(a)?.chain_work();
        let work_b = reader.node(b)?.chain_work();
        let seq_a = self.state(a)?.sequence_id;
        let seq_b = self.state(b)?.sequence_id;
        Ok(work_a
            .cmp(&work_b)
            .then_with(|| seq_b.cmp(&seq_a))
            .then_with(|| b.cmp(&a)))
    }

    pub(crate) fn anchor_parent(&self, id: NodeId) -> Option<Hash256> {
        self.records.anchor_parents.get(&id).copied()
    }

    /// Replaces the progress record of a node rebuilt from disk. Chain tx is relinked
    /// afterwards, except on anchors where it is the trusted seed.
    pub(crate) fn restore_state(&mut self, id: NodeId, state: NodeState) -> Result<(), BlockTreeError> {
        *self.state_mut(id)? = state;
        Ok(())
    }

    pub(crate) fn take_dirty(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.records.dirty).into_iter().collect()
    }

    pub(crate) fn mark_dirty(&mut self, ids: impl IntoIterator<Item = NodeId>) {
        self.records.dirty.extend(ids);
    }

    pub fn dirty_len(&self) -> usize {
        self.records.dirty.len()
    }

    /// Chooses the most-work valid node, first inserted on ties.
    pub(crate) fn refresh_best_header(
        &mut self,
        nodes: &[BlockIndexNode],
    ) -> Result<(), BlockTreeError> {
        let mut best: Option<(NodeId, U256)> = None;
        for (index, node) in nodes.iter().enumerate() {
            let id = NodeId::from_index(index).ok_or(BlockTreeError::ArenaFull)?;
            if self.state(id)?.status.is_invalid() {
                continue;
            }
            let better = best.map_or(true, |(_, work)| node.chain_work() > work);
            if better {
                best = Some((id, node.chain_work()));
            }
        }
        self.records.best_header = best.map(|(id, _)| id);
        Ok(())
    }

    fn consider_best_header(&mut self, id: NodeId, chain_work: U256) -> Result<(), BlockTreeError> {
        let replace = match self.records.best_header {
            None => true,
            Some(best) => chain_work > self.tree.reader()?.node(best)?.chain_work(),
        };
        if replace {
            self.records.best_header = Some(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{Invalidity, Verdict};

    const EASY_BITS: u32 = 0x207f_ffff;

    fn child_of(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [nonce as u8; 32],
            time: 1_700_000_000 + nonce * 600,
            bits: EASY_BITS,
            nonce,
        }
    }

    /// Builds a chain of `len` headers and returns the ids in height order.
    fn build_chain(tree: &BlockTree, len: u32) -> Vec<NodeId> {
        let mut prev = [0u8; 32];
        let mut ids = Vec::new();
        for nonce in 0..len {
            let header = child_of(prev, nonce);
            ids.push(
                tree.insert_header(&header, 0, nonce as i32)
                    .expect("insert header"),
            );
            prev = header.hash();
        }
        ids
    }

    fn extend(tree: &BlockTree, from: NodeId, len: u32, salt: u32) -> Vec<NodeId> {
        let mut prev = *tree.reader().expect("reader").node(from).expect("node").hash();
        let mut ids = Vec::new();
        for step in 0..len {
            let header = child_of(prev, salt + step);
            ids.push(
                tree.insert_header(&header, 0, (salt + step) as i32)
                    .expect("insert header"),
            );
            prev = header.hash();
        }
        ids
    }

    #[test]
    fn insert_computes_height_work_and_skip() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 21);
        let reader = tree.reader().expect("reader");
        for (height, id) in ids.iter().enumerate() {
            let node = reader.node(*id).expect("node");
            assert_eq!(node.height(), height as i32);
            assert_eq!(node.chain_work(), U256::from(2u64 * (height as u64 + 1)));
            if height >= 1 {
                let skip = node.skip().expect("skip");
                assert_eq!(
                    reader.node(skip).expect("skip node").height(),
                    skiplist::skip_height(height as i32)
                );
            }
        }
        assert_eq!(tree.genesis().expect("genesis"), Some(ids[0]));
        assert_eq!(tree.best_header().expect("best"), Some(ids[20]));
        assert_eq!(tree.len().expect("len"), 21);
    }

    #[test]
    fn known_header_returns_existing_handle() {
        let tree = BlockTree::new();
        let genesis = child_of([0u8; 32], 0);
        let first = tree.insert_header(&genesis, 0, 0).expect("insert");
        let second = tree.insert_header(&genesis, 5, 9).expect("insert");
        assert_eq!(first, second);
        assert_eq!(tree.len().expect("len"), 1);
    }

    #[test]
    fn unknown_prev_and_second_root_are_rejected() {
        let tree = BlockTree::new();
        build_chain(&tree, 2);
        let orphan = child_of([7u8; 32], 1);
        assert_eq!(
            tree.insert_header(&orphan, 0, 0),
            Err(BlockTreeError::MissingPrev([7u8; 32]))
        );
        let other_root = child_of([0u8; 32], 99);
        assert_eq!(
            tree.insert_header(&other_root, 0, 0),
            Err(BlockTreeError::DuplicateRoot(other_root.hash()))
        );
    }

    #[test]
    fn bad_difficulty_bits_are_rejected() {
        let tree = BlockTree::new();
        let mut header = child_of([0u8; 32], 0);
        header.bits = 0x0480_0001;
        assert_eq!(
            tree.insert_header(&header, 0, 0),
            Err(BlockTreeError::InvalidHeader("invalid difficulty target"))
        );
        assert!(tree.is_empty().expect("empty"));
    }

    #[test]
    fn block_header_round_trips_hash() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 5);
        let reader = tree.reader().expect("reader");
        for id in ids {
            let header = reader.block_header(id).expect("header");
            assert_eq!(&header.hash(), reader.node(id).expect("node").hash());
        }
    }

    #[test]
    fn time_max_tracks_running_maximum() {
        let tree = BlockTree::new();
        let genesis = child_of([0u8; 32], 10);
        let mut early = child_of(genesis.hash(), 1);
        early.time = genesis.time - 100;
        let genesis_id = tree.insert_header(&genesis, 0, 0).expect("genesis");
        let early_id = tree.insert_header(&early, 0, 1).expect("early");
        let reader = tree.reader().expect("reader");
        assert_eq!(
            reader.node(early_id).expect("node").block_time_max(),
            reader.node(genesis_id).expect("node").block_time()
        );
    }

    #[test]
    fn best_header_prefers_work_then_first_seen() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 5);
        let fork = extend(&tree, ids[2], 2, 1_000);
        // Equal work to the main tip, inserted later and with a later sequence id.
        assert_eq!(tree.best_header().expect("best"), Some(ids[4]));
        let longer = extend(&tree, fork[1], 1, 2_000);
        assert_eq!(tree.best_header().expect("best"), Some(longer[0]));

        let guard = tree.lock().expect("lock");
        assert_eq!(guard.work_ordering(longer[0], ids[4]).expect("cmp"), Ordering::Greater);
        assert_eq!(guard.work_ordering(ids[4], fork[1]).expect("cmp"), Ordering::Greater);
        assert_eq!(guard.work_ordering(fork[1], fork[1]).expect("cmp"), Ordering::Equal);
    }

    #[test]
    fn raise_validity_is_monotonic() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 3);
        let mut guard = tree.lock().expect("lock");
        let id = ids[2];
        assert!(guard.is_valid(id, BlockValidity::Tree).expect("valid"));
        assert!(!guard.raise_validity(id, BlockValidity::Header).expect("raise"));
        assert!(guard.raise_validity(id, BlockValidity::Chain).expect("raise"));
        assert!(!guard.raise_validity(id, BlockValidity::Transactions).expect("raise"));
        assert_eq!(guard.status(id).expect("status").validity(), BlockValidity::Chain);
        assert!(guard.raise_validity(id, BlockValidity::Scripts).expect("raise"));
        assert!(guard.is_valid(id, BlockValidity::Scripts).expect("valid"));
    }

    #[test]
    fn failed_block_cannot_be_raised() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 15);
        let mut guard = tree.lock().expect("lock");
        let target = ids[10];
        let marked = guard.mark_failed(target).expect("mark failed");
        assert_eq!(marked, 4);

        assert!(!guard.is_valid(target, BlockValidity::Transactions).expect("valid"));
        assert!(!guard.raise_validity(target, BlockValidity::Scripts).expect("raise"));
        assert_eq!(
            guard.status(target).expect("status").verdict(),
            Verdict::Invalid {
                level: BlockValidity::Tree,
                cause: Invalidity::Failed,
            }
        );
        assert!(guard.status(ids[14]).expect("status").has_failed_parent());
        assert!(guard.is_valid(ids[9], BlockValidity::Tree).expect("valid"));
        assert_eq!(guard.best_header(), Some(ids[9]));
    }

    #[test]
    fn children_of_failed_blocks_start_invalid() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 4);
        tree.lock().expect("lock").mark_failed(ids[3]).expect("mark");
        let child = extend(&tree, ids[3], 1, 500)[0];
        let guard = tree.lock().expect("lock");
        assert!(guard.status(child).expect("status").has_failed_parent());
        assert_eq!(guard.best_header(), Some(ids[2]));
    }

    #[test]
    fn mark_failed_parent_refreshes_best_header() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 3);
        let mut guard = tree.lock().expect("lock");
        assert!(guard.mark_failed_parent(ids[2]).expect("mark"));
        assert!(!guard.mark_failed_parent(ids[2]).expect("mark"));
        assert_eq!(guard.best_header(), Some(ids[1]));
    }

    #[test]
    fn locators_follow_data_and_pruning() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 2);
        let mut guard = tree.lock().expect("lock");
        let id = ids[1];
        assert_eq!(guard.block_pos(id).expect("pos"), None);
        assert_eq!(
            guard.set_undo_data(id, 10),
            Err(BlockTreeError::MissingData(id))
        );

        guard.set_block_data(id, FlatFilePos::new(2, 800)).expect("data");
        guard.set_undo_data(id, 96).expect("undo");
        assert_eq!(guard.block_pos(id).expect("pos"), Some(FlatFilePos::new(2, 800)));
        assert_eq!(guard.undo_pos(id).expect("pos"), Some(FlatFilePos::new(2, 96)));

        assert!(guard.prune_block_data(id).expect("prune"));
        assert!(!guard.prune_block_data(id).expect("prune"));
        assert_eq!(guard.block_pos(id).expect("pos"), None);
        assert_eq!(guard.undo_pos(id).expect("pos"), None);
    }

    #[test]
    fn out_of_order_transactions_link_when_gap_fills() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 4);
        let mut guard = tree.lock().expect("lock");
        let pos = FlatFilePos::new(0, 0);

        assert!(guard.received_transactions(ids[0], 1, 200, pos).expect("recv").len() == 1);
        assert!(guard.received_transactions(ids[2], 3, 300, pos).expect("recv").is_empty());
        assert!(guard.received_transactions(ids[3], 4, 400, pos).expect("recv").is_empty());
        assert!(!guard.have_num_chain_txs(ids[3]).expect("chain tx"));
        assert_eq!(guard.tx_count(ids[2]).expect("tx"), 3);

        let linked = guard.received_transactions(ids[1], 2, 250, pos).expect("recv");
        assert_eq!(linked, vec![ids[1], ids[2], ids[3]]);
        assert_eq!(guard.chain_tx(ids[0]).expect("chain tx"), 1);
        assert_eq!(guard.chain_tx(ids[1]).expect("chain tx"), 3);
        assert_eq!(guard.chain_tx(ids[2]).expect("chain tx"), 6);
        assert_eq!(guard.chain_tx(ids[3]).expect("chain tx"), 10);
        assert_eq!(guard.size(ids[1]).expect("size"), 250);
        assert!(guard.is_valid(ids[3], BlockValidity::Transactions).expect("valid"));
    }

    #[test]
    fn zero_transactions_are_rejected() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 1);
        let mut guard = tree.lock().expect("lock");
        assert_eq!(
            guard.received_transactions(ids[0], 0, 0, FlatFilePos::new(0, 0)),
            Err(BlockTreeError::InvalidTxCount(ids[0]))
        );
    }

    #[test]
    fn receiving_a_block_twice_keeps_descendant_counts() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 3);
        let mut guard = tree.lock().expect("lock");
        for id in &ids {
            guard
                .received_transactions(*id, 1, 100, FlatFilePos::new(0, 0))
                .expect("recv");
        }
        guard.prune_block_data(ids[1]).expect("prune");

        assert_eq!(
            guard.received_transactions(ids[1], 5, 100, FlatFilePos::new(2, 0)),
            Err(BlockTreeError::AlreadyReceived(ids[1]))
        );
        let linked = guard
            .received_transactions(ids[1], 1, 100, FlatFilePos::new(2, 64))
            .expect("again");
        assert!(linked.is_empty());
        assert_eq!(guard.block_pos(ids[1]).expect("pos"), Some(FlatFilePos::new(2, 64)));
        let chain_tx: Vec<u64> = ids
            .iter()
            .map(|id| guard.chain_tx(*id).expect("chain tx"))
            .collect();
        assert_eq!(chain_tx, vec![1, 2, 3]);
    }

    #[test]
    fn anchor_seeds_chain_tx_for_descendants() {
        let tree = BlockTree::new();
        let anchor_header = child_of([9u8; 32], 77);
        let anchor = tree
            .insert_anchor(&anchor_header, 1_000, U256::from(5_000u64), 0)
            .expect("anchor");
        let children = extend(&tree, anchor, 3, 300);
        let pos = FlatFilePos::new(1, 0);

        let mut guard = tree.lock().expect("lock");
        for child in &children {
            assert!(guard.received_transactions(*child, 2, 100, pos).expect("recv").is_empty());
        }
        assert_eq!(
            guard.set_anchor_chain_tx(children[0], 10),
            Err(BlockTreeError::NotAnAnchor(children[0]))
        );
        let linked = guard.set_anchor_chain_tx(anchor, 50_000).expect("seed");
        assert_eq!(linked, children);
        assert_eq!(guard.chain_tx(children[2]).expect("chain tx"), 50_006);
        assert_eq!(guard.anchor_parent(anchor), Some([9u8; 32]));
        drop(guard);

        let reader = tree.reader().expect("reader");
        assert_eq!(reader.node(children[2]).expect("node").height(), 1_003);
        assert_eq!(reader.ancestor(children[2], 1_000).expect("ancestor"), Some(anchor));
        assert_eq!(
            reader.ancestor(children[2], 10),
            Err(BlockTreeError::BrokenLink { height: 1_000 })
        );
        assert_eq!(reader.block_header(anchor).expect("header").prev_block, [0u8; 32]);
    }

    #[test]
    fn anchor_below_height_one_is_rejected() {
        let tree = BlockTree::new();
        assert_eq!(
            tree.insert_anchor(&child_of([1u8; 32], 0), 0, U256::one(), 0),
            Err(BlockTreeError::InvalidHeader(
                "trust anchor must sit above genesis"
            ))
        );
    }

    #[test]
    fn anchor_on_an_indexed_predecessor_is_rejected() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 3);
        let tip_hash = *tree.reader().expect("reader").node(ids[2]).expect("node").hash();
        let header = child_of(tip_hash, 50);
        assert_eq!(
            tree.insert_anchor(&header, 40, U256::one() << 20, 0),
            Err(BlockTreeError::InvalidHeader(
                "trust anchor predecessor is already indexed"
            ))
        );
        assert_eq!(tree.len().expect("len"), 3);
        assert_eq!(tree.lookup(&header.hash()).expect("lookup"), None);
    }

    #[test]
    fn common_ancestor_of_fork_branches() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 30);
        let fork = extend(&tree, ids[17], 20, 5_000);
        let reader = tree.reader().expect("reader");
        assert_eq!(
            reader.last_common_ancestor(ids[29], fork[19]).expect("lca"),
            Some(ids[17])
        );
        assert_eq!(
            reader.last_common_ancestor(ids[5], ids[29]).expect("lca"),
            Some(ids[5])
        );
        assert!(reader.is_ancestor(ids[17], fork[3]).expect("ancestor"));
        assert!(!reader.is_ancestor(ids[18], fork[3]).expect("ancestor"));
    }

    #[test]
    fn dirty_set_drains_once() {
        let tree = BlockTree::new();
        build_chain(&tree, 3);
        let mut guard = tree.lock().expect("lock");
        assert_eq!(guard.dirty_len(), 3);
        assert_eq!(guard.take_dirty().len(), 3);
        assert_eq!(guard.dirty_len(), 0);
    }

    #[test]
    fn describe_names_height_and_hash() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 2);
        let reader = tree.reader().expect("reader");
        let text = reader.describe(ids[1]).expect("describe");
        assert!(text.starts_with("BlockIndexNode(prev=#0, height=1, merkle="));
        assert!(text.contains(&hash256_to_hex(reader.node(ids[1]).expect("node").hash())));
    }

    #[test]
    fn median_time_past_through_reader() {
        let tree = BlockTree::new();
        let ids = build_chain(&tree, 3);
        let reader = tree.reader().expect("reader");
        let expected = reader.node(ids[1]).expect("node").block_time();
        assert_eq!(reader.median_time_past(ids[2]).expect("mtp"), expected);
        assert_eq!(tree.metrics().snapshot().median_queries, 1);
    }
}
