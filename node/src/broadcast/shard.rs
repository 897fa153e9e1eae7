use crate::broadcast::BroadcastId;
use crate::peer::ProcessId;
use crate::utilities::hash::blake2_256;
use crate::view::ViewData;

/// Picks the relay targets of one process for one broadcast.
pub(crate) trait ShardStrategy: Send {
    fn targets(&self, id: &BroadcastId, view: &ViewData, own_id: &ProcessId) -> ViewData;
}

/// Relay to the whole view. This is plain reliable broadcast without any
/// fan-out bound.
pub(crate) struct FullView;

impl ShardStrategy for FullView {
    fn targets(&self, _id: &BroadcastId, view: &ViewData, own_id: &ProcessId) -> ViewData {
        view.iter().filter(|id| *id != own_id).copied().collect()
    }
}

/// Relay to a bounded shard of the view, picked by `compute_shard`.
pub(crate) struct RingShard {
    shard_size: usize,
}

impl RingShard {
    pub(crate) fn new(shard_size: usize) -> Self {
        Self { shard_size }
    }
}

impl ShardStrategy for RingShard {
    fn targets(&self, id: &BroadcastId, view: &ViewData, own_id: &ProcessId) -> ViewData {
        compute_shard(id, view, own_id, self.shard_size)
    }
}

/// Deterministically select `min(shard_size, |view| - 1)` relay targets for
/// `own_id`, excluding `own_id` itself.
///
/// Members are placed on a ring in `ProcessId` order. The first target is
/// always the ring successor of `own_id`; the successor edges alone connect
/// the whole view, so flooding along shards reaches every member no matter
/// how small the shard is. The remaining targets are chords derived from the
/// broadcast id, which cut down the hop count for larger shards.
///
/// Pure function of its inputs: repeated calls return the same set, and all
/// processes sharing a view snapshot compute one consistent overlay.
pub(crate) fn compute_shard(
    id: &BroadcastId,
    view: &ViewData,
    own_id: &ProcessId,
    shard_size: usize,
) -> ViewData {
    let members: Vec<ProcessId> = view.iter().copied().collect();
    let n = members.len();
    if n <= 1 || shard_size == 0 {
        return ViewData::new();
    }
    let target_count = shard_size.min(n - 1);

    let position = members.iter().position(|m| m == own_id);
    let start = match position {
        Some(p) => (p + 1) % n,
        // Not a view member; anchor on an id-derived offset instead.
        None => ring_offset(id, own_id, 0, n),
    };

    let mut shard = ViewData::new();
    if members[start] != *own_id {
        shard.insert(members[start]);
    }

    let mut round: u64 = 1;
    while shard.len() < target_count && round <= 4 * n as u64 {
        let candidate = members[ring_offset(id, own_id, round, n)];
        if candidate != *own_id {
            shard.insert(candidate);
        }
        round += 1;
    }

    // The hash chain can keep colliding on small views; fill the remainder by
    // walking the ring.
    let mut step = 1;
    while shard.len() < target_count {
        let candidate = members[(start + step) % n];
        if candidate != *own_id {
            shard.insert(candidate);
        }
        step += 1;
    }

    shard
}

fn ring_offset(id: &BroadcastId, own_id: &ProcessId, round: u64, n: usize) -> usize {
    let mut buffer = Vec::with_capacity(64);
    buffer.extend_from_slice(id.as_hash().as_ref());
    buffer.extend_from_slice(&own_id.as_bytes());
    buffer.extend_from_slice(&round.to_be_bytes());
    let hash = blake2_256(&buffer);
    let mut word = [0u8; 8];
    word.copy_from_slice(&hash.as_ref()[..8]);
    (u64::from_be_bytes(word) % n as u64) as usize
}
