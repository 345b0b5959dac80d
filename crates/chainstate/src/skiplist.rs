//! Deterministic ancestor skip pointers and the accelerated ancestor walk.
//!
//! Every node stores one extra back reference to the ancestor at `skip_height(height)`.
//! The target depends on the height alone, so the structure is identical across restarts,
//! and any ancestor is reachable in a logarithmic number of hops.

use crate::blockindex::{BlockIndexNode, NodeId};
use crate::tree::BlockTreeError;

/// Turns the lowest set bit of `value` off.
fn invert_lowest_one(value: i32) -> i32 {
    value & value.wrapping_sub(1)
}

/// Height the skip pointer of a node at `height` targets.
pub fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    // Odd heights clear two bits of the even height below them.
    if height & 1 != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Result of an ancestor walk together with the number of links followed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Walk {
    pub found: Option<NodeId>,
    pub hops: u32,
}

pub(crate) fn node(nodes: &[BlockIndexNode], id: NodeId) -> Result<&BlockIndexNode, BlockTreeError> {
    nodes.get(id.index()).ok_or(BlockTreeError::UnknownNode(id))
}

/// Whether a walk sitting at `height` should take its skip pointer on the way to `target`.
fn should_follow_skip(height: i32, target: i32) -> bool {
    let height_skip = skip_height(height);
    let height_skip_prev = skip_height(height - 1);
    // Step to the predecessor instead when its skip reaches further back without passing
    // the target.
    height_skip == target
        || (height_skip > target
            && !(height_skip_prev < height_skip - 2 && height_skip_prev >= target))
}

pub(crate) fn walk(
    nodes: &[BlockIndexNode],
    from: NodeId,
    target: i32,
) -> Result<Walk, BlockTreeError> {
    let start = node(nodes, from)?;
    if target < 0 || target > start.height() {
        return Ok(Walk {
            found: None,
            hops: 0,
        });
    }

    let mut cursor = from;
    let mut entry = start;
    let mut hops = 0u32;
    while entry.height() > target {
        let height = entry.height();
        let (next, next_height) = match entry.skip() {
            Some(skip) if should_follow_skip(height, target) => (skip, skip_height(height)),
            _ => {
                let prev = entry.prev().ok_or(BlockTreeError::BrokenLink { height })?;
                (prev, height - 1)
            }
        };
        let next_entry = node(nodes, next)?;
        if next_entry.height() != next_height {
            return Err(BlockTreeError::CorruptLink {
                expected: next_height,
                found: next_entry.height(),
            });
        }
        cursor = next;
        entry = next_entry;
        hops += 1;
    }

    Ok(Walk {
        found: Some(cursor),
        hops,
    })
}

/// Ancestor of `from` at `height`, or `None` when `height` is outside `[0, from.height]`.
pub fn ancestor(
    nodes: &[BlockIndexNode],
    from: NodeId,
    height: i32,
) -> Result<Option<NodeId>, BlockTreeError> {
    walk(nodes, from, height).map(|walk| walk.found)
}

/// Resolves the skip pointer for a node at `height` whose predecessor is `prev`.
///
/// The predecessor's own skip pointers are already built, so the lookup itself runs in
/// logarithmic time. Chains rooted at a trust anchor have no ancestors below the anchor;
/// such nodes keep no skip pointer and fall back to predecessor steps.
pub fn build_skip(
    nodes: &[BlockIndexNode],
    prev: Option<NodeId>,
    height: i32,
) -> Result<Option<NodeId>, BlockTreeError> {
    let Some(prev) = prev else {
        return Ok(None);
    };
    match ancestor(nodes, prev, skip_height(height)) {
        Ok(found) => Ok(found),
        Err(BlockTreeError::BrokenLink { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}
