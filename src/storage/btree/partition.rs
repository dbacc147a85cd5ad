//! Splitting one range into independently scannable sub-ranges.
//!
//! Boundaries are separator keys taken from the highest internal level that
//! has enough of them. Consecutive boundaries form half-open ranges, so the
//! partitions cover the requested range exactly no matter how the tree
//! changes before or while they are scanned.

use std::cmp::Ordering;

use super::logic::MAX_TREE_DEPTH;
use super::seek::{SeekContext, SeekCursor};
use crate::types::{Result, TreeError};

/// Returns `from`, up to `desired - 1` inner boundaries and `to`, strictly
/// increasing.
pub(crate) fn partition_bounds(
    cx: &SeekContext,
    from: &[u8],
    to: &[u8],
    desired: usize,
) -> Result<Vec<Vec<u8>>> {
    if desired == 0 {
        return Err(TreeError::InvalidArgument("at least one partition is required"));
    }
    match (cx.cmp)(from, to) {
        Ordering::Greater => {
            return Err(TreeError::InvalidArgument(
                "partitioned seek only supports forward ranges",
            ))
        }
        Ordering::Equal => return Ok(vec![from.to_vec(), to.to_vec()]),
        Ordering::Less => {}
    }

    let mut keys: Vec<Vec<u8>> = Vec::new();
    if desired > 1 {
        let mut cursor = SeekCursor::new(cx.clone());
        for level in 0..MAX_TREE_DEPTH {
            cursor.seek_level(from, to, level);
            let mut found = Vec::new();
            while cursor.next()? {
                if (cx.cmp)(cursor.key(), from) == Ordering::Greater {
                    found.push(cursor.key().to_vec());
                }
            }
            if cursor.at_leaf() {
                break;
            }
            keys = found;
            if keys.len() + 1 >= desired {
                break;
            }
        }
    }

    let mut bounds = Vec::with_capacity(desired + 1);
    bounds.push(from.to_vec());
    if keys.len() < desired {
        bounds.extend(keys);
    } else {
        let len = keys.len();
        bounds.extend((1..desired).map(|i| keys[i * len / desired].clone()));
    }
    bounds.push(to.to_vec());
    tracing::debug!(
        target: "genbtree::seek",
        desired,
        partitions = bounds.len() - 1,
        "partitioned seek"
    );
    Ok(bounds)
}
