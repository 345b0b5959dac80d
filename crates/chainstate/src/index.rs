//! Persistence of the block index: one record per node keyed by block hash.

use std::sync::Arc;
use std::time::Instant;

use blocktree_consensus::{hash256_to_hex, Hash256};
use blocktree_pow::difficulty::{work_from_bytes, work_to_bytes};
use blocktree_primitives::block::BlockHeader;
use blocktree_primitives::encoding::{DecodeError, Decoder, Encoder};
use blocktree_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;
use rayon::prelude::*;

use crate::blockindex::{NodeId, NodeState};
use crate::status::BlockStatus;
use crate::tree::{BlockTree, BlockTreeError, ChainGuard, TreeReader};

const META_BEST_HEADER_KEY: &[u8] = b"best_header";

const RECORD_LINKED: u8 = 0;
const RECORD_ANCHOR: u8 = 1;

/// Trusted values an anchor cannot derive from its ancestors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AnchorRecord {
    pub chain_work: U256,
    pub chain_tx: u64,
}

/// On-disk form of a node. Chain work, skip pointers, chain tx counts and arrival
/// bookkeeping are rebuilt on load.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskBlockIndex {
    pub header: BlockHeader,
    pub height: i32,
    pub status: BlockStatus,
    pub file_id: u32,
    pub data_offset: u32,
    pub undo_offset: u32,
    pub tx_count: u32,
    pub size: u32,
    pub anchor: Option<AnchorRecord>,
}

pub fn encode_disk_index(record: &DiskBlockIndex) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(160);
    record.header.encode_into(&mut encoder);
    encoder.write_i32_le(record.height);
    encoder.write_u32_le(record.status.to_bits());
    encoder.write_u32_le(record.file_id);
    encoder.write_u32_le(record.data_offset);
    encoder.write_u32_le(record.undo_offset);
    encoder.write_u32_le(record.tx_count);
    encoder.write_u32_le(record.size);
    match record.anchor {
        None => encoder.write_u8(RECORD_LINKED),
        Some(anchor) => {
            encoder.write_u8(RECORD_ANCHOR);
            encoder.write_bytes(&work_to_bytes(anchor.chain_work));
            encoder.write_u64_le(anchor.chain_tx);
        }
    }
    encoder.into_inner()
}

pub fn decode_disk_index(bytes: &[u8]) -> Result<DiskBlockIndex, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let header = BlockHeader::consensus_decode_from(&mut decoder)?;
    let height = decoder.read_i32_le()?;
    let status = BlockStatus::from_bits(decoder.read_u32_le()?)
        .ok_or(DecodeError::InvalidData("unknown block status bits"))?;
    let file_id = decoder.read_u32_le()?;
    let data_offset = decoder.read_u32_le()?;
    let undo_offset = decoder.read_u32_le()?;
    let tx_count = decoder.read_u32_le()?;
    let size = decoder.read_u32_le()?;
    let anchor = match decoder.read_u8()? {
        RECORD_LINKED => None,
        RECORD_ANCHOR => {
            let chain_work = work_from_bytes(&decoder.read_fixed::<32>()?);
            let chain_tx = decoder.read_u64_le()?;
            Some(AnchorRecord {
                chain_work,
                chain_tx,
            })
        }
        _ => return Err(DecodeError::InvalidData("unknown block index record kind")),
    };
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    if height < 0 {
        return Err(DecodeError::InvalidData("negative block height"));
    }
    Ok(DiskBlockIndex {
        header,
        height,
        status,
        file_id,
        data_offset,
        undo_offset,
        tx_count,
        size,
        anchor,
    })
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, BlockTreeError> {
    bytes
        .try_into()
        .map_err(|_| BlockTreeError::CorruptIndex("invalid hash length".to_string()))
}

pub struct BlockIndexDb<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> BlockIndexDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<DiskBlockIndex>, BlockTreeError> {
        let bytes = match self.store.get(Column::BlockIndex, hash)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        decode_disk_index(&bytes)
            .map(Some)
            .map_err(|err| corrupt_record(hash, err))
    }

    pub fn best_header_hash(&self) -> Result<Option<Hash256>, BlockTreeError> {
        match self.store.get(Column::Meta, META_BEST_HEADER_KEY)? {
            Some(bytes) => decode_hash(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Writes every node changed since the last flush in one batch. Nodes stay dirty if
    /// the write fails.
    pub fn flush(&self, tree: &BlockTree) -> Result<usize, BlockTreeError> {
        let mut guard = tree.lock()?;
        let dirty = guard.take_dirty();
        if dirty.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let result = self.write_records(&guard, &dirty);
        match result {
            Ok(written) => {
                blocktree_log::log_info!(
                    "Flushed {} block index records in {}ms",
                    written,
                    started.elapsed().as_millis()
                );
                Ok(written)
            }
            Err(err) => {
                guard.mark_dirty(dirty);
                Err(err)
            }
        }
    }

    fn write_records(&self, guard: &ChainGuard<'_>, dirty: &[NodeId]) -> Result<usize, BlockTreeError> {
        let reader = guard.reader()?;
        let mut batch = WriteBatch::new();
        batch.reserve(dirty.len() + 1);
        for id in dirty {
            let record = disk_record(guard, &reader, *id)?;
            batch.put(
                Column::BlockIndex,
                *reader.node(*id)?.hash(),
                encode_disk_index(&record),
            );
        }
        if let Some(best) = guard.best_header() {
            batch.put(Column::Meta, META_BEST_HEADER_KEY, *reader.node(best)?.hash());
        }
        self.store.write_batch(&batch)?;
        Ok(dirty.len())
    }

    /// Rebuilds a tree from every stored record. Records are relinked by predecessor hash
    /// in height order; chain work, skip pointers and chain tx counts are recomputed.
    pub fn load(&self) -> Result<BlockTree, BlockTreeError> {
        let started = Instant::now();
        let entries = self.store.scan_prefix(Column::BlockIndex, &[])?;
        let mut records = entries
            .par_iter()
            .map(|(key, value)| {
                let hash = decode_hash(key)?;
                let record = decode_disk_index(value).map_err(|err| corrupt_record(&hash, err))?;
                if record.header.hash() != hash {
                    return Err(BlockTreeError::CorruptIndex(format!(
                        "record {} holds header {}",
                        hash256_to_hex(&hash),
                        hash256_to_hex(&record.header.hash())
                    )));
                }
                Ok(record)
            })
            .collect::<Result<Vec<_>, BlockTreeError>>()?;
        records.sort_by_key(|record| record.height);

        let tree = BlockTree::new();
        {
            let mut guard = tree.lock()?;
            let mut ids = Vec::with_capacity(records.len());
            for record in &records {
                let id = restore_node(&mut guard, record)?;
                guard.restore_state(
                    id,
                    NodeState {
                        status: record.status,
                        file_id: record.file_id,
                        data_offset: record.data_offset,
                        undo_offset: record.undo_offset,
                        tx_count: record.tx_count,
                        size: record.size,
                        chain_tx: record.anchor.map_or(0, |anchor| anchor.chain_tx),
                        sequence_id: 0,
                    },
                )?;
                ids.push(id);
            }
            for id in &ids {
                guard.connect_chain_tx(*id)?;
            }

            let reader = guard.reader()?;
            guard.refresh_best_header(reader.nodes())?;
            let _ = guard.take_dirty();

            match guard.best_header() {
                Some(best) => {
                    let node = reader.node(best)?;
                    blocktree_log::log_info!(
                        "Loaded {} block index entries in {}ms, best header {} at height {}",
                        ids.len(),
                        started.elapsed().as_millis(),
                        hash256_to_hex(node.hash()),
                        node.height()
                    );
                }
                None => blocktree_log::log_info!("Block index is empty"),
            }
        }
        Ok(tree)
    }
}

fn corrupt_record(hash: &Hash256, err: DecodeError) -> BlockTreeError {
    BlockTreeError::CorruptIndex(format!("record {}: {err}", hash256_to_hex(hash)))
}

fn disk_record(
    guard: &ChainGuard<'_>,
    reader: &TreeReader<'_>,
    id: NodeId,
) -> Result<DiskBlockIndex, BlockTreeError> {
    let node = reader.node(id)?;
    let state = guard.state(id)?;
    let mut header = reader.block_header(id)?;
    let anchor = if node.is_anchor() {
        header.prev_block = guard.anchor_parent(id).unwrap_or([0u8; 32]);
        Some(AnchorRecord {
            chain_work: node.chain_work(),
            chain_tx: state.chain_tx,
        })
    } else {
        None
    };
    Ok(DiskBlockIndex {
        header,
        height: node.height(),
        status: state.status,
        file_id: state.file_id,
        data_offset: state.data_offset,
        undo_offset: state.undo_offset,
        tx_count: state.tx_count,
        size: state.size,
        anchor,
    })
}

fn restore_node(guard: &mut ChainGuard<'_>, record: &DiskBlockIndex) -> Result<NodeId, BlockTreeError> {
    let hash = record.header.hash();
    if let Some(anchor) = record.anchor {
        return guard.insert_anchor(&record.header, record.height, anchor.chain_work, 0);
    }
    let id = guard.insert_header(&record.header, 0, 0).map_err(|err| match err {
        BlockTreeError::MissingPrev(prev) => BlockTreeError::CorruptIndex(format!(
            "block {} at height {} references missing predecessor {}",
            hash256_to_hex(&hash),
            record.height,
            hash256_to_hex(&prev)
        )),
        BlockTreeError::DuplicateRoot(_) => BlockTreeError::CorruptIndex(format!(
            "second root {} at height {}",
            hash256_to_hex(&hash),
            record.height
        )),
        other => other,
    })?;
    let height = guard.reader()?.node(id)?.height();
    if height != record.height {
        return Err(BlockTreeError::CorruptIndex(format!(
            "block {} stored at height {} links at height {}",
            hash256_to_hex(&hash),
            record.height,
            height
        )));
    }
    Ok(id)
}
