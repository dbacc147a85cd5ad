//! Resolution of inserts that hit an existing key.

use std::ops::Add;

use super::layout::Layout;
use crate::types::Result;

/// Outcome of merging a new value into an existing entry.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MergeResult<V> {
    /// Store this value instead of the existing one.
    Merged(V),
    /// Store the new value.
    Replaced,
    /// Keep the existing value.
    Unchanged,
    /// Remove the entry altogether.
    Removed,
}

/// Decides what happens when an inserted key already exists.
pub trait ValueMerger<V> {
    /// Merges `new` into `existing`.
    fn merge(&mut self, existing: &V, new: &V) -> MergeResult<V>;
}

impl<V, F> ValueMerger<V> for F
where
    F: FnMut(&V, &V) -> MergeResult<V>,
{
    fn merge(&mut self, existing: &V, new: &V) -> MergeResult<V> {
        self(existing, new)
    }
}

/// Replaces the existing value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Overwrite;

impl<V> ValueMerger<V> for Overwrite {
    fn merge(&mut self, _existing: &V, _new: &V) -> MergeResult<V> {
        MergeResult::Replaced
    }
}

/// Leaves the existing value in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepExisting;

impl<V> ValueMerger<V> for KeepExisting {
    fn merge(&mut self, _existing: &V, _new: &V) -> MergeResult<V> {
        MergeResult::Unchanged
    }
}

/// Combines both values with a function, e.g. addition for counters.
#[derive(Debug, Clone, Copy)]
pub struct Combine<V>(pub fn(&V, &V) -> V);

impl<V> Combine<V>
where
    V: Add<Output = V> + Clone,
{
    /// Adds the new value to the existing one.
    pub fn add() -> Self {
        Combine(|existing: &V, new: &V| existing.clone() + new.clone())
    }
}

impl<V> ValueMerger<V> for Combine<V> {
    fn merge(&mut self, existing: &V, new: &V) -> MergeResult<V> {
        MergeResult::Merged((self.0)(existing, new))
    }
}

/// Removes the entry if the existing value equals the new one, otherwise
/// replaces it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOnMatch;

impl<V: PartialEq> ValueMerger<V> for RemoveOnMatch {
    fn merge(&mut self, existing: &V, new: &V) -> MergeResult<V> {
        if existing == new {
            MergeResult::Removed
        } else {
            MergeResult::Replaced
        }
    }
}

/// Merge step on encoded values used by the tree logic.
pub(crate) type ByteMerger<'a> = dyn FnMut(&[u8]) -> Result<MergeResult<Vec<u8>>> + 'a;

/// Adapts a typed merger to encoded values.
pub(crate) fn encoded<'a, L, M>(
    merger: &'a mut M,
    new: &'a L::Value,
) -> impl FnMut(&[u8]) -> Result<MergeResult<Vec<u8>>> + 'a
where
    L: Layout,
    M: ValueMerger<L::Value> + ?Sized,
{
    move |existing| {
        let existing = L::decode_value(existing)?;
        Ok(match merger.merge(&existing, new) {
            MergeResult::Merged(value) => {
                let mut out = Vec::new();
                L::encode_value(&value, &mut out);
                MergeResult::Merged(out)
            }
            MergeResult::Replaced => MergeResult::Replaced,
            MergeResult::Unchanged => MergeResult::Unchanged,
            MergeResult::Removed => MergeResult::Removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::layout::U64Layout;

    #[test]
    fn builtin_mergers() {
        assert_eq!(Overwrite.merge(&1u64, &2), MergeResult::Replaced);
        assert_eq!(KeepExisting.merge(&1u64, &2), MergeResult::Unchanged);
        assert_eq!(Combine::<u64>::add().merge(&1, &2), MergeResult::Merged(3));
        assert_eq!(RemoveOnMatch.merge(&4u64, &4), MergeResult::Removed);
        assert_eq!(RemoveOnMatch.merge(&4u64, &5), MergeResult::Replaced);
    }

    #[test]
    fn encoded_merger_roundtrips_values() -> Result<()> {
        let mut add = Combine::<u64>::add();
        let new = 5u64;
        let mut merge = encoded::<U64Layout, _>(&mut add, &new);
        let result = merge(&10u64.to_be_bytes())?;
        assert_eq!(result, MergeResult::Merged(15u64.to_be_bytes().to_vec()));
        Ok(())
    }
}
