use std::collections::BTreeSet;
use std::fmt::Display;

use crate::peer::ProcessId;

/// Membership known at a point in time.
///
/// Iteration order is the total order of `ProcessId`, which every process
/// agrees on. Shard computation relies on that.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewData(BTreeSet<ProcessId>);

impl ViewData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ProcessId) {
        self.0.insert(id);
    }

    pub fn remove(&mut self, id: &ProcessId) -> bool {
        self.0.remove(id)
    }

    pub fn is_member(&self, id: &ProcessId) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessId> {
        self.0.iter()
    }

    /// Merge other view into this view.
    pub fn merge(&mut self, other: &ViewData) {
        for id in other.iter() {
            self.0.insert(*id);
        }
    }

    pub fn is_subset(&self, other: &ViewData) -> bool {
        self.0.is_subset(&other.0)
    }

    /// The number of matching signed acknowledgements required to commit a
    /// broadcast against this view: `n - floor((n - 1) / 3)`.
    pub fn quorum_size(&self) -> usize {
        Self::quorum_of(self.len())
    }

    pub fn quorum_of(view_size: usize) -> usize {
        if view_size == 0 {
            return 0;
        }
        view_size - (view_size - 1) / 3
    }
}

impl FromIterator<ProcessId> for ViewData {
    fn from_iter<T: IntoIterator<Item = ProcessId>>(iter: T) -> Self {
        ViewData(iter.into_iter().collect())
    }
}

impl Display for ViewData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut leading_space = false;
        write!(f, "[")?;
        for id in self.iter() {
            if leading_space {
                write!(f, " ")?;
            }
            write!(f, "{id}")?;
            leading_space = true;
        }
        write!(f, "]")
    }
}

/// External source of the process membership, e.g. the registration chain
/// state. The engine never invents members on its own.
pub trait ViewFetcher: Send + Sync {
    /// Membership valid at `timestamp_ms`.
    fn view_at(&self, timestamp_ms: u64) -> ViewData;

    /// When the registration of `id` expires, in epoch milliseconds.
    fn expiration_time(&self, id: &ProcessId) -> u64;

    /// How long `id` is banned from the membership; zero means not banned.
    fn ban_period(&self, id: &ProcessId) -> u64;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_quorum_size() {
        // n - floor((n - 1) / 3)
        assert_eq!(ViewData::quorum_of(0), 0);
        assert_eq!(ViewData::quorum_of(1), 1);
        assert_eq!(ViewData::quorum_of(2), 2);
        assert_eq!(ViewData::quorum_of(4), 3);
        assert_eq!(ViewData::quorum_of(10), 7);
        assert_eq!(ViewData::quorum_of(34), 23);
        assert_eq!(ViewData::quorum_of(50), 34);
    }

    #[test]
    fn test_merge_deduplicates() {
        let a = ProcessId::random();
        let b = ProcessId::random();
        let mut view: ViewData = vec![a, b].into_iter().collect();
        let other: ViewData = vec![b].into_iter().collect();
        view.merge(&other);
        assert_eq!(view.len(), 2);
        assert!(other.is_subset(&view));
    }

    #[test]
    fn test_ordered_iteration() {
        let mut view = ViewData::new();
        for _ in 0..10 {
            view.insert(ProcessId::random());
        }
        let members: Vec<_> = view.iter().collect();
        let mut sorted = members.clone();
        sorted.sort();
        assert_eq!(members, sorted);
    }
}
