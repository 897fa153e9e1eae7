use log::trace;

use crate::view::ViewData;

pub(crate) trait Quorum {
    fn commit_threshold(&self, acks: usize) -> bool;
}

/// Single threshold quorum over a fixed view snapshot: a broadcast commits
/// once `n - f` distinct members acknowledged it, `f = floor((n - 1) / 3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BftQuorum {
    pub(crate) view_size: usize,
    pub(crate) max_faulty_nodes: usize,
}

impl BftQuorum {
    pub(crate) fn new(view_size: usize) -> Self {
        let max_faulty_nodes = if view_size == 0 {
            0
        } else {
            (view_size - 1) / 3
        };
        Self {
            view_size,
            max_faulty_nodes,
        }
    }

    pub(crate) fn quorum_size(&self) -> usize {
        ViewData::quorum_of(self.view_size)
    }
}

impl Quorum for BftQuorum {
    fn commit_threshold(&self, acks: usize) -> bool {
        if self.view_size == 0 {
            return false;
        }
        let threshold = self.quorum_size();
        if acks >= threshold {
            trace!("Commit threshold reached: Acked:{acks} / Threshold:{threshold}");
            true
        } else {
            trace!("Commit threshold not reached: Acked:{acks} / Threshold:{threshold}");
            false
        }
    }
}
