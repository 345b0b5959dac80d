use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

use serde::Serialize;

use blocktree_chainstate::metrics::TreeMetricsSnapshot;
use blocktree_chainstate::{BlockTree, BlockValidity, ChainTrust, Invalidity, Verdict};
use blocktree_consensus::params::{hash256_to_hex, Network};

#[derive(Clone, Debug, Serialize)]
pub(crate) struct IndexSummary {
    pub network: &'static str,
    pub entries: usize,
    pub anchors: usize,
    pub tips: usize,
    pub validity: BTreeMap<&'static str, usize>,
    pub failed: usize,
    pub failed_parent: usize,
    pub with_data: usize,
    pub with_undo: usize,
    pub dirty: usize,
    pub best_header: Option<BestHeaderSummary>,
    pub metrics: MetricsSummary,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct BestHeaderSummary {
    pub hash: String,
    pub height: i32,
    pub chain_work: String,
    pub chain_tx: u64,
    pub median_time_past: i64,
    pub validity: &'static str,
    pub meets_minimum_chain_work: bool,
    pub assume_valid: Option<String>,
    pub assumed_valid: bool,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct MetricsSummary {
    pub headers_inserted: u64,
    pub anchors_inserted: u64,
    pub ancestor_queries: u64,
    pub mean_ancestor_hops: f64,
    pub max_ancestor_hops: u64,
    pub median_queries: u64,
    pub invalidations: u64,
    pub chain_tx_linked: u64,
}

impl From<TreeMetricsSnapshot> for MetricsSummary {
    fn from(snapshot: TreeMetricsSnapshot) -> Self {
        Self {
            headers_inserted: snapshot.headers_inserted,
            anchors_inserted: snapshot.anchors_inserted,
            ancestor_queries: snapshot.ancestor_queries,
            mean_ancestor_hops: snapshot.mean_ancestor_hops(),
            max_ancestor_hops: snapshot.max_ancestor_hops,
            median_queries: snapshot.median_queries,
            invalidations: snapshot.invalidations,
            chain_tx_linked: snapshot.chain_tx_linked,
        }
    }
}

pub(crate) fn collect_index_summary(
    tree: &BlockTree,
    trust: &ChainTrust,
    network: Network,
) -> Result<IndexSummary, String> {
    // Trust checks take their own locks; settle them before holding the chain lock.
    let best = tree.best_header().map_err(|err| err.to_string())?;
    let (meets_minimum_chain_work, assumed_valid) = match best {
        Some(id) => (
            trust
                .meets_minimum_chain_work(tree, id)
                .map_err(|err| err.to_string())?,
            trust.assumed_valid(tree, id).map_err(|err| err.to_string())?,
        ),
        None => (false, false),
    };

    let guard = tree.lock().map_err(|err| err.to_string())?;
    let reader = guard.reader().map_err(|err| err.to_string())?;

    let mut validity: BTreeMap<&'static str, usize> = BTreeMap::new();
    for level in BlockValidity::ALL {
        validity.insert(level.as_str(), 0);
    }
    let mut anchors = 0usize;
    let mut failed = 0usize;
    let mut failed_parent = 0usize;
    let mut with_data = 0usize;
    let mut with_undo = 0usize;
    let mut parents: HashSet<usize> = HashSet::with_capacity(reader.len());

    for (index, node) in reader.nodes().iter().enumerate() {
        if node.is_anchor() {
            anchors += 1;
        }
        if let Some(prev) = node.prev() {
            parents.insert(prev.index());
        }
        let Some(id) = blocktree_chainstate::NodeId::from_index(index) else {
            continue;
        };
        let state = guard.state(id).map_err(|err| err.to_string())?;
        match state.status.verdict() {
            Verdict::Valid(level) => *validity.entry(level.as_str()).or_default() += 1,
            Verdict::Invalid { cause, .. } => match cause {
                Invalidity::Failed => failed += 1,
                Invalidity::FailedParent => failed_parent += 1,
            },
        }
        if state.status.has_data() {
            with_data += 1;
        }
        if state.status.has_undo() {
            with_undo += 1;
        }
    }

    let best_header = match best {
        Some(id) => {
            let node = reader.node(id).map_err(|err| err.to_string())?;
            Some(BestHeaderSummary {
                hash: hash256_to_hex(node.hash()),
                height: node.height(),
                chain_work: format!("{:064x}", node.chain_work()),
                chain_tx: guard.chain_tx(id).map_err(|err| err.to_string())?,
                median_time_past: reader
                    .median_time_past(id)
                    .map_err(|err| err.to_string())?,
                validity: guard
                    .status(id)
                    .map_err(|err| err.to_string())?
                    .validity()
                    .as_str(),
                meets_minimum_chain_work,
                assume_valid: trust.assume_valid().as_ref().map(hash256_to_hex),
                assumed_valid,
            })
        }
        None => None,
    };

    Ok(IndexSummary {
        network: network.as_str(),
        entries: reader.len(),
        anchors,
        tips: reader.len() - parents.len(),
        validity,
        failed,
        failed_parent,
        with_data,
        with_undo,
        dirty: guard.dirty_len(),
        best_header,
        metrics: tree.metrics().snapshot().into(),
    })
}

impl IndexSummary {
    pub(crate) fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "network: {}", self.network);
        let _ = writeln!(
            out,
            "entries: {} (tips {}, anchors {}, unflushed {})",
            self.entries, self.tips, self.anchors, self.dirty
        );
        let _ = writeln!(out, "validity:");
        for level in BlockValidity::ALL {
            let count = self.validity.get(level.as_str()).copied().unwrap_or(0);
            let _ = writeln!(out, "  {:<13} {count}", level.as_str());
        }
        let _ = writeln!(out, "  {:<13} {}", "failed", self.failed);
        let _ = writeln!(out, "  {:<13} {}", "failed-parent", self.failed_parent);
        let _ = writeln!(out, "block data: {} (undo {})", self.with_data, self.with_undo);
        match &self.best_header {
            Some(best) => {
                let _ = writeln!(out, "best header: {} at height {}", best.hash, best.height);
                let _ = writeln!(out, "  validity: {}", best.validity);
                let _ = writeln!(out, "  chain work: {}", best.chain_work);
                let _ = writeln!(out, "  chain tx: {}", best.chain_tx);
                let _ = writeln!(out, "  median time past: {}", best.median_time_past);
                let _ = writeln!(
                    out,
                    "  minimum chain work met: {}",
                    best.meets_minimum_chain_work
                );
                let _ = writeln!(
                    out,
                    "  assume-valid: {} (covers best header: {})",
                    best.assume_valid.as_deref().unwrap_or("disabled"),
                    best.assumed_valid
                );
            }
            None => {
                let _ = writeln!(out, "best header: none");
            }
        }
        let _ = writeln!(
            out,
            "ancestor queries: {} (mean {:.2} hops, max {})",
            self.metrics.ancestor_queries,
            self.metrics.mean_ancestor_hops,
            self.metrics.max_ancestor_hops
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocktree_chainstate::FlatFilePos;
    use blocktree_consensus::params::consensus_params;
    use blocktree_primitives::block::BlockHeader;

    fn header(prev_block: [u8; 32], nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block,
            merkle_root: [0u8; 32],
            time: 1_700_000_000 + nonce * 120,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    #[test]
    fn summary_counts_validity_and_tips() {
        let tree = BlockTree::new();
        let mut prev = [0u8; 32];
        let mut ids = Vec::new();
        for nonce in 0..6 {
            let block = header(prev, nonce);
            ids.push(tree.insert_header(&block, 0, nonce as i32).expect("insert"));
            prev = block.hash();
        }
        let fork = header(*tree.reader().expect("reader").node(ids[2]).expect("node").hash(), 99);
        let fork_id = tree.insert_header(&fork, 0, 99).expect("fork");
        {
            let mut guard = tree.lock().expect("lock");
            guard
                .received_transactions(ids[0], 1, 200, FlatFilePos::new(0, 0))
                .expect("received");
            guard.mark_failed(fork_id).expect("fail");
        }

        let trust = ChainTrust::new(&consensus_params(Network::Regtest)).with_assume_valid(None);
        let summary = collect_index_summary(&tree, &trust, Network::Regtest).expect("summary");
        assert_eq!(summary.network, "regtest");
        assert_eq!(summary.entries, 7);
        assert_eq!(summary.tips, 2);
        assert_eq!(summary.anchors, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.with_data, 1);
        assert_eq!(summary.validity["transactions"], 1);
        assert_eq!(summary.validity["tree"], 5);
        assert_eq!(summary.validity["scripts"], 0);

        let best = summary.best_header.as_ref().expect("best");
        assert_eq!(best.height, 5);
        assert_eq!(best.chain_tx, 0);
        assert!(!best.assumed_valid);
        assert!(best.assume_valid.is_none());

        let text = summary.render_text();
        assert!(text.contains("entries: 7 (tips 2, anchors 0"), "{text}");
        assert!(text.contains("assume-valid: disabled"), "{text}");

        let json = serde_json::to_value(&summary).expect("json");
        assert_eq!(json["best_header"]["height"], 5);
        assert_eq!(json["validity"]["tree"], 5);
    }

    #[test]
    fn empty_tree_has_no_best_header() {
        let tree = BlockTree::new();
        let trust = ChainTrust::new(&consensus_params(Network::Mainnet));
        let summary = collect_index_summary(&tree, &trust, Network::Mainnet).expect("summary");
        assert_eq!(summary.entries, 0);
        assert_eq!(summary.tips, 0);
        assert!(summary.best_header.is_none());
        assert!(summary.render_text().contains("best header: none"));
    }
}
