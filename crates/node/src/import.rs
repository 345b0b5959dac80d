use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use blocktree_chainstate::BlockTree;
use blocktree_consensus::constants::BLOCK_HEADER_SIZE;
use blocktree_consensus::params::hash256_to_hex;
use blocktree_consensus::ConsensusParams;
use blocktree_pow::difficulty::within_pow_limit;
use blocktree_primitives::block::BlockHeader;

const PROGRESS_INTERVAL: usize = 10_000;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub(crate) struct ImportStats {
    pub read: usize,
    pub inserted: usize,
    pub known: usize,
}

/// Indexes a file of back-to-back serialized headers. Each header must follow one already in
/// the tree or earlier in the file, except a null-prev genesis on an empty tree, and carry a
/// target within the network's proof-of-work limit.
pub(crate) fn import_headers(
    tree: &BlockTree,
    path: &Path,
    params: &ConsensusParams,
) -> Result<ImportStats, String> {
    let bytes = fs::read(path).map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    if bytes.len() % BLOCK_HEADER_SIZE != 0 {
        return Err(format!(
            "{} is {} bytes, not a multiple of {BLOCK_HEADER_SIZE}",
            path.display(),
            bytes.len()
        ));
    }
    insert_serialized_headers(tree, &bytes, params, unix_time_now())
}

pub(crate) fn insert_serialized_headers(
    tree: &BlockTree,
    bytes: &[u8],
    params: &ConsensusParams,
    time_received: i64,
) -> Result<ImportStats, String> {
    let mut stats = ImportStats::default();
    let mut guard = tree.lock().map_err(|err| err.to_string())?;
    let mut sequence_id = i32::try_from(guard.reader().map_err(|err| err.to_string())?.len())
        .map_err(|_| "block index is full".to_string())?;

    for (index, chunk) in bytes.chunks_exact(BLOCK_HEADER_SIZE).enumerate() {
        let header = BlockHeader::consensus_decode(chunk)
            .map_err(|err| format!("header {index}: {err}"))?;
        stats.read += 1;
        let hash = header.hash();
        if tree.lookup(&hash).map_err(|err| err.to_string())?.is_some() {
            stats.known += 1;
            continue;
        }
        let within_limit = within_pow_limit(header.bits, params)
            .map_err(|err| format!("header {index} ({}): {err}", hash256_to_hex(&hash)))?;
        if !within_limit {
            return Err(format!(
                "header {index} ({}): difficulty target above the {} limit",
                hash256_to_hex(&hash),
                params.network.as_str()
            ));
        }
        if !header.has_prev() && hash != params.hash_genesis_block {
            log_warn!(
                "Import: root header {} does not match the {} genesis block",
                hash256_to_hex(&hash),
                params.network.as_str()
            );
        }
        guard
            .insert_header(&header, time_received, sequence_id)
            .map_err(|err| format!("header {index} ({}): {err}", hash256_to_hex(&hash)))?;
        sequence_id = sequence_id.saturating_add(1);
        stats.inserted += 1;
        if stats.read % PROGRESS_INTERVAL == 0 {
            log_debug!("Import: {} headers processed", stats.read);
        }
    }
    Ok(stats)
}

fn unix_time_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocktree_consensus::params::{consensus_params, Network};

    fn serialized_chain(len: u32) -> (Vec<u8>, Vec<[u8; 32]>) {
        let mut bytes = Vec::new();
        let mut hashes = Vec::new();
        let mut prev = [0u8; 32];
        for nonce in 0..len {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [3u8; 32],
                time: 1_700_000_000 + nonce * 120,
                bits: 0x207f_ffff,
                nonce,
            };
            bytes.extend_from_slice(&header.consensus_encode());
            prev = header.hash();
            hashes.push(prev);
        }
        (bytes, hashes)
    }

    #[test]
    fn imports_and_skips_known_headers() {
        let params = consensus_params(Network::Regtest);
        let tree = BlockTree::new();
        let (bytes, hashes) = serialized_chain(25);

        let stats = insert_serialized_headers(&tree, &bytes[..10 * BLOCK_HEADER_SIZE], &params, 5)
            .expect("first half");
        assert_eq!(stats, ImportStats { read: 10, inserted: 10, known: 0 });

        let stats = insert_serialized_headers(&tree, &bytes, &params, 6).expect("all");
        assert_eq!(stats, ImportStats { read: 25, inserted: 15, known: 10 });

        let tip = tree.best_header().expect("best").expect("tip");
        let reader = tree.reader().expect("reader");
        assert_eq!(reader.node(tip).expect("node").hash(), &hashes[24]);
        assert_eq!(reader.node(tip).expect("node").height(), 24);
        assert_eq!(reader.node(tip).expect("node").header_received_time(), 6);
    }

    #[test]
    fn orphan_header_is_rejected() {
        let params = consensus_params(Network::Regtest);
        let tree = BlockTree::new();
        let (bytes, _) = serialized_chain(4);
        let err = insert_serialized_headers(&tree, &bytes[2 * BLOCK_HEADER_SIZE..], &params, 0)
            .expect_err("orphan");
        assert!(err.starts_with("header 0 ("), "{err}");
    }

    #[test]
    fn target_easier_than_network_limit_is_rejected() {
        let tree = BlockTree::new();
        let (bytes, _) = serialized_chain(3);
        let mainnet = consensus_params(Network::Mainnet);
        let err = insert_serialized_headers(&tree, &bytes, &mainnet, 0).expect_err("too easy");
        assert!(err.starts_with("header 0 ("), "{err}");
        assert!(err.ends_with("difficulty target above the main limit"), "{err}");
        assert!(tree.is_empty().expect("empty"));
    }

    #[test]
    fn file_length_must_be_whole_headers() {
        let params = consensus_params(Network::Regtest);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("headers.bin");
        let (mut bytes, _) = serialized_chain(3);
        fs::write(&path, &bytes).expect("write");
        let tree = BlockTree::new();
        assert_eq!(
            import_headers(&tree, &path, &params).expect("import").inserted,
            3
        );

        bytes.push(0);
        fs::write(&path, &bytes).expect("write");
        let err = import_headers(&BlockTree::new(), &path, &params).expect_err("truncated");
        assert!(err.contains("not a multiple of 80"), "{err}");
    }
}
