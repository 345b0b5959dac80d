//! Median of recent block timestamps.

use blocktree_consensus::constants::MEDIAN_TIME_SPAN;

use crate::blockindex::{BlockIndexNode, NodeId};
use crate::skiplist::node;
use crate::tree::BlockTreeError;

/// Median time of the block at `id` and up to ten of its predecessors.
///
/// With fewer than `MEDIAN_TIME_SPAN` blocks available the window shrinks; the element at
/// index `count / 2` of the sorted window is returned.
pub fn median_time_past(nodes: &[BlockIndexNode], id: NodeId) -> Result<i64, BlockTreeError> {
    let mut times = [0i64; MEDIAN_TIME_SPAN];
    let mut count = 0usize;
    let mut cursor = Some(id);
    while count < MEDIAN_TIME_SPAN {
        let Some(current) = cursor else {
            break;
        };
        let entry = node(nodes, current)?;
        times[count] = entry.block_time();
        count += 1;
        cursor = entry.prev();
    }

    let window = &mut times[..count];
    window.sort_unstable();
    Ok(window[count / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocktree_primitives::block::BlockHeader;
    use primitive_types::U256;

    fn chain_with_times(times: &[u32]) -> Vec<BlockIndexNode> {
        times
            .iter()
            .enumerate()
            .map(|(height, time)| {
                let header = BlockHeader {
                    version: 1,
                    prev_block: [0u8; 32],
                    merkle_root: [0u8; 32],
                    time: *time,
                    bits: 0x207f_ffff,
                    nonce: height as u32,
                };
                let prev = height.checked_sub(1).and_then(NodeId::from_index);
                BlockIndexNode::new(&header, height as i32, prev, U256::zero(), *time, 0)
            })
            .collect()
    }

    fn tip(nodes: &[BlockIndexNode]) -> NodeId {
        NodeId::from_index(nodes.len() - 1).expect("index fits")
    }

    #[test]
    fn single_block_is_its_own_median() {
        let nodes = chain_with_times(&[500]);
        assert_eq!(median_time_past(&nodes, tip(&nodes)).expect("mtp"), 500);
    }

    #[test]
    fn short_window_takes_element_at_half_count() {
        let nodes = chain_with_times(&[10, 20]);
        assert_eq!(median_time_past(&nodes, tip(&nodes)).expect("mtp"), 20);

        let nodes = chain_with_times(&[10, 20, 30, 40]);
        assert_eq!(median_time_past(&nodes, tip(&nodes)).expect("mtp"), 30);
    }

    #[test]
    fn window_is_capped_at_eleven_blocks() {
        let times: Vec<u32> = (0..20).map(|i| 1_000 + i * 10).collect();
        let nodes = chain_with_times(&times);
        // Window covers heights 9..=19, median is height 14.
        assert_eq!(median_time_past(&nodes, tip(&nodes)).expect("mtp"), 1_140);
    }

    #[test]
    fn out_of_order_times_are_sorted() {
        let nodes = chain_with_times(&[100, 900, 200, 800, 300, 700, 400, 600, 500, 50, 950]);
        assert_eq!(median_time_past(&nodes, tip(&nodes)).expect("mtp"), 500);
    }

    #[test]
    fn single_outlier_cannot_move_the_median() {
        let mut times: Vec<u32> = (0..11).map(|i| 1_000 + i * 600).collect();
        let honest = {
            let nodes = chain_with_times(&times);
            median_time_past(&nodes, tip(&nodes)).expect("mtp")
        };
        if let Some(last) = times.last_mut() {
            *last = u32::MAX;
        }
        let nodes = chain_with_times(&times);
        assert_eq!(median_time_past(&nodes, tip(&nodes)).expect("mtp"), honest);
    }
}
