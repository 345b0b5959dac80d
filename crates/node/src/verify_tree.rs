use std::fmt::Write as _;

use serde::Serialize;

use blocktree_chainstate::skiplist::skip_height;
use blocktree_chainstate::{BlockTree, BlockTreeError, ChainGuard, NodeId, TreeReader};
use blocktree_consensus::params::hash256_to_hex;
use blocktree_pow::difficulty::block_proof;

/// Failures past this many are counted but not described.
const MAX_REPORTED_FAILURES: usize = 100;

#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct VerifyReport {
    pub checked: usize,
    pub failures: Vec<String>,
    pub unreported: usize,
}

impl VerifyReport {
    fn fail(&mut self, reader: &TreeReader<'_>, id: NodeId, what: impl std::fmt::Display) {
        if self.failures.len() >= MAX_REPORTED_FAILURES {
            self.unreported += 1;
            return;
        }
        let label = reader
            .node(id)
            .map(|node| format!("{} at height {}", hash256_to_hex(node.hash()), node.height()))
            .unwrap_or_else(|_| id.to_string());
        self.failures.push(format!("{label}: {what}"));
    }

    pub(crate) fn failure_count(&self) -> usize {
        self.failures.len() + self.unreported
    }

    pub(crate) fn render_text(&self) -> String {
        let mut out = String::new();
        for failure in &self.failures {
            let _ = writeln!(out, "FAIL {failure}");
        }
        if self.unreported > 0 {
            let _ = writeln!(out, "... and {} more", self.unreported);
        }
        let _ = writeln!(
            out,
            "checked {} entries, {} failures",
            self.checked,
            self.failure_count()
        );
        out
    }
}

/// Recomputes every derived field of the loaded index from its predecessor links and
/// reports entries that disagree.
pub(crate) fn verify_tree(tree: &BlockTree) -> Result<VerifyReport, String> {
    let guard = tree.lock().map_err(|err| err.to_string())?;
    let reader = guard.reader().map_err(|err| err.to_string())?;
    let mut report = VerifyReport::default();
    for index in 0..reader.len() {
        let Some(id) = NodeId::from_index(index) else {
            break;
        };
        verify_node(tree, &guard, &reader, id, &mut report).map_err(|err| err.to_string())?;
        report.checked += 1;
    }
    log_info!(
        "Verify: checked {} entries, {} failures",
        report.checked,
        report.failure_count()
    );
    Ok(report)
}

fn verify_node(
    tree: &BlockTree,
    guard: &ChainGuard<'_>,
    reader: &TreeReader<'_>,
    id: NodeId,
    report: &mut VerifyReport,
) -> Result<(), BlockTreeError> {
    let node = reader.node(id)?;
    let state = guard.state(id)?;

    if tree.lookup(node.hash())? != Some(id) {
        report.fail(reader, id, "hash lookup does not resolve to this entry");
    }

    let Some(prev) = node.prev() else {
        if !node.is_anchor() && node.height() != 0 {
            report.fail(reader, id, "root entry is neither genesis nor an anchor");
        }
        return verify_median(reader, id, report);
    };
    let parent = reader.node(prev)?;
    let parent_state = guard.state(prev)?;

    if node.height() != parent.height() + 1 {
        report.fail(
            reader,
            id,
            format_args!("height does not follow predecessor height {}", parent.height()),
        );
    }

    match block_proof(node.bits()) {
        Ok(proof) if node.chain_work() == parent.chain_work().saturating_add(proof) => {}
        Ok(_) => report.fail(reader, id, "chain work is not predecessor work plus block proof"),
        Err(err) => report.fail(reader, id, format_args!("bad difficulty bits: {err}")),
    }

    if node.block_time_max() != parent.block_time_max().max(node.block_time()) {
        report.fail(reader, id, "maximum block time does not cover the predecessor");
    }

    let expected_skip = skip_height(node.height());
    match node.skip() {
        Some(skip) => {
            if reader.node(skip)?.height() != expected_skip {
                report.fail(reader, id, format_args!("skip pointer is not at height {expected_skip}"));
            } else if reader.ancestor(prev, expected_skip)? != Some(skip) {
                report.fail(reader, id, "skip pointer is off the predecessor path");
            }
        }
        None => match reader.ancestor(prev, expected_skip) {
            Err(BlockTreeError::BrokenLink { .. }) => {}
            Ok(_) => report.fail(reader, id, "skip pointer is missing"),
            Err(err) => return Err(err),
        },
    }

    let expected_chain_tx = if state.tx_count == 0 || parent_state.chain_tx == 0 {
        0
    } else {
        parent_state.chain_tx.saturating_add(u64::from(state.tx_count))
    };
    if state.chain_tx != expected_chain_tx {
        report.fail(
            reader,
            id,
            format_args!("chain tx {} but expected {expected_chain_tx}", state.chain_tx),
        );
    }

    if parent_state.status.is_invalid() && !state.status.is_invalid() {
        report.fail(reader, id, "descends from an invalid block but is not marked invalid");
    }

    verify_median(reader, id, report)
}

fn verify_median(
    reader: &TreeReader<'_>,
    id: NodeId,
    report: &mut VerifyReport,
) -> Result<(), BlockTreeError> {
    let node = reader.node(id)?;
    let median = reader.median_time_past(id)?;
    if median > node.block_time_max() {
        report.fail(reader, id, "median time past exceeds the maximum block time");
    }
    Ok(())
}
