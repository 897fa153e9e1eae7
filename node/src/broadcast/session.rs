use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::broadcast::quorum::{BftQuorum, Quorum};
use crate::broadcast::{BroadcastId, Payload, QuorumCertificate};
use crate::crypto::Certificate;
use crate::peer::ProcessId;
use crate::utilities::hash::Hash;
use crate::view::ViewData;

/// States only advance, never regress. `Retired` is not represented here:
/// a retired session is simply removed from the session table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    Disseminated,
    AckCollecting,
    Committed,
    Delivered,
}

#[derive(Debug, Clone)]
pub struct SessionTimestamp(Instant);

impl Default for SessionTimestamp {
    fn default() -> Self {
        SessionTimestamp(Instant::now())
    }
}

/// Per-broadcast state owned by the local engine.
///
/// The view and shard snapshots are captured once at creation and never
/// change afterwards, so every participant reasons about quorum against the
/// same membership size even when the live view moves on.
pub(crate) struct BroadcastSession {
    pub(crate) id: BroadcastId,
    state: SessionState,
    pub(crate) view_snapshot: ViewData,
    pub(crate) shard_snapshot: ViewData,
    quorum: BftQuorum,
    payload: Option<Payload>,
    originator: Option<ProcessId>,
    /// Distinct acknowledgements keyed by signer, each tagged with the
    /// payload hash it was verified against. Only acknowledgements of the
    /// bound payload count towards quorum.
    acks: BTreeMap<ProcessId, (Hash, Certificate)>,
    quorum_certificate: Option<QuorumCertificate>,
    /// A commit that arrived before the payload did. Applied once the payload
    /// is known.
    pending_commit: Option<(Hash, QuorumCertificate)>,
    /// Whether we signed an acknowledgement ourselves, i.e. the payload
    /// passed local validation.
    acked: bool,
    delivered: bool,
    created_at: SessionTimestamp,
    delivered_at: Option<Instant>,
}

impl BroadcastSession {
    pub(crate) fn new(id: BroadcastId, view_snapshot: ViewData, shard_snapshot: ViewData) -> Self {
        let quorum = BftQuorum::new(view_snapshot.len());
        BroadcastSession {
            id,
            state: SessionState::Created,
            view_snapshot,
            shard_snapshot,
            quorum,
            payload: None,
            originator: None,
            acks: BTreeMap::new(),
            quorum_certificate: None,
            pending_commit: None,
            acked: false,
            delivered: false,
            created_at: SessionTimestamp::default(),
            delivered_at: None,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Advance the state machine. Regressions are ignored, state is monotone.
    pub(crate) fn advance(&mut self, state: SessionState) {
        if state > self.state {
            log::trace!("Session {}: {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.state >= SessionState::Committed
    }

    pub(crate) fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub(crate) fn payload_hash(&self) -> Option<Hash> {
        self.payload.as_ref().map(Payload::hash)
    }

    pub(crate) fn originator(&self) -> Option<&ProcessId> {
        self.originator.as_ref()
    }

    /// Bind the payload to this session. Returns `Ok(true)` when the payload
    /// was not known before, `Ok(false)` for a duplicate of the bound payload
    /// and an error for a conflicting one. The first bound payload wins, a
    /// session never swaps payloads.
    pub(crate) fn bind_payload(
        &mut self,
        payload: Payload,
        originator: ProcessId,
    ) -> Result<bool, Hash> {
        match &self.payload {
            Some(existing) if existing.hash() != payload.hash() => Err(existing.hash()),
            Some(_) => Ok(false),
            None => {
                let bound = payload.hash();
                // Acknowledgements collected before the payload was known may
                // cover a different hash. They must not count towards quorum.
                self.acks.retain(|_, (hash, _)| *hash == bound);
                self.payload = Some(payload);
                self.originator = Some(originator);
                Ok(true)
            }
        }
    }

    pub(crate) fn acked(&self) -> bool {
        self.acked
    }

    pub(crate) fn mark_acked(&mut self) {
        self.acked = true;
    }

    /// Record one acknowledgement over the given payload hash. Returns false
    /// for a signer already counted.
    pub(crate) fn add_ack(&mut self, payload_hash: Hash, certificate: Certificate) -> bool {
        let signer = certificate.signer();
        if self.acks.contains_key(&signer) {
            return false;
        }
        self.acks.insert(signer, (payload_hash, certificate));
        true
    }

    /// Acknowledgements of the expected payload hash, or all of them while no
    /// hash is expected yet.
    pub(crate) fn ack_count(&self) -> usize {
        match self.expected_payload_hash() {
            Some(expected) => self
                .acks
                .values()
                .filter(|(hash, _)| *hash == expected)
                .count(),
            None => self.acks.len(),
        }
    }

    pub(crate) fn has_ack(&self, signer: &ProcessId) -> bool {
        self.acks.contains_key(signer)
    }

    /// The hash acknowledgements are expected to cover: the bound payload's,
    /// or the one a held commit certificate vouches for.
    pub(crate) fn expected_payload_hash(&self) -> Option<Hash> {
        self.payload_hash()
            .or_else(|| self.pending_commit.as_ref().map(|(hash, _)| *hash))
    }

    /// Quorum counts only acknowledgements of the bound payload. Without a
    /// bound payload there is nothing to commit.
    pub(crate) fn has_commit_quorum(&self) -> bool {
        match self.payload_hash() {
            Some(bound) => {
                let matching = self
                    .acks
                    .values()
                    .filter(|(hash, _)| *hash == bound)
                    .count();
                self.quorum.commit_threshold(matching)
            }
            None => false,
        }
    }

    pub(crate) fn quorum_size(&self) -> usize {
        self.quorum.quorum_size()
    }

    /// Assemble the acknowledgements of the bound payload into a commit
    /// certificate.
    pub(crate) fn assemble_certificate(&mut self) -> QuorumCertificate {
        let certificate: QuorumCertificate = match self.payload_hash() {
            Some(bound) => self
                .acks
                .iter()
                .filter(|(_, (hash, _))| *hash == bound)
                .map(|(signer, (_, certificate))| (*signer, certificate.clone()))
                .collect(),
            None => QuorumCertificate::new(),
        };
        self.quorum_certificate = Some(certificate.clone());
        certificate
    }

    pub(crate) fn accept_certificate(&mut self, certificate: QuorumCertificate) {
        if self.quorum_certificate.is_none() {
            self.quorum_certificate = Some(certificate);
        }
    }

    pub(crate) fn set_pending_commit(&mut self, payload_hash: Hash, certificate: QuorumCertificate) {
        if self.pending_commit.is_none() {
            self.acks.retain(|_, (hash, _)| *hash == payload_hash);
            self.pending_commit = Some((payload_hash, certificate));
        }
    }

    pub(crate) fn has_pending_commit(&self) -> bool {
        self.pending_commit.is_some()
    }

    pub(crate) fn take_pending_commit(&mut self) -> Option<(Hash, QuorumCertificate)> {
        self.pending_commit.take()
    }

    /// Latch delivery. Returns true exactly once per session.
    pub(crate) fn record_delivery(&mut self) -> bool {
        if self.delivered {
            return false;
        }
        self.delivered = true;
        self.delivered_at = Some(Instant::now());
        true
    }

    pub(crate) fn delivered(&self) -> bool {
        self.delivered
    }

    /// Delivered sessions expire after the retention window, stalled ones
    /// after the TTL.
    pub(crate) fn is_expired(&self, now: Instant, ttl: Duration, retention: Duration) -> bool {
        match self.delivered_at {
            Some(delivered_at) => now.duration_since(delivered_at) >= retention,
            None => now.duration_since(self.created_at.0) >= ttl,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_session(view_size: usize) -> BroadcastSession {
        let view: ViewData = (0..view_size).map(|_| ProcessId::random()).collect();
        let id = BroadcastId::derive(
            view.iter().next().unwrap(),
            &Payload::new(b"block".to_vec()).hash(),
            1,
        );
        BroadcastSession::new(id, view, ViewData::new())
    }

    #[test]
    fn test_state_only_advances() {
        let mut session = new_session(4);
        assert_eq!(session.state(), SessionState::Created);

        session.advance(SessionState::AckCollecting);
        assert_eq!(session.state(), SessionState::AckCollecting);

        session.advance(SessionState::Disseminated);
        assert_eq!(session.state(), SessionState::AckCollecting);

        session.advance(SessionState::Delivered);
        assert!(session.is_committed());
    }

    #[test]
    fn test_delivery_latches_once() {
        let mut session = new_session(4);
        assert!(session.record_delivery());
        assert!(!session.record_delivery());
        assert!(session.delivered());
    }

    #[test]
    fn test_conflicting_payload_rejected() {
        let mut session = new_session(4);
        let originator = ProcessId::random();
        let payload = Payload::new(b"block".to_vec());

        assert_eq!(session.bind_payload(payload.clone(), originator), Ok(true));
        // Duplicate of the bound payload is fine.
        assert_eq!(session.bind_payload(payload.clone(), originator), Ok(false));
        // A conflicting payload for the same broadcast id is equivocation.
        let conflicting = Payload::new(b"other".to_vec());
        assert_eq!(
            session.bind_payload(conflicting, originator),
            Err(payload.hash())
        );
        assert_eq!(session.payload_hash(), Some(payload.hash()));
    }

    fn ack_from_fresh_signer() -> Certificate {
        let keypair = crate::crypto::Keypair::generate();
        crate::crypto::Certificate::new(keypair.public_key(), vec![1, 2, 3])
    }

    #[test]
    fn test_acks_counted_per_signer() {
        let mut session = new_session(4);
        let hash = Payload::new(b"block".to_vec()).hash();
        let certificate = ack_from_fresh_signer();

        assert!(session.add_ack(hash, certificate.clone()));
        assert!(!session.add_ack(hash, certificate));
        assert_eq!(session.ack_count(), 1);
    }

    #[test]
    fn test_stale_acks_dropped_when_payload_binds() {
        let mut session = new_session(7);
        let stale_hash = Payload::new(b"never bound".to_vec()).hash();
        for _ in 0..5 {
            assert!(session.add_ack(stale_hash, ack_from_fresh_signer()));
        }
        assert_eq!(session.ack_count(), 5);

        let payload = Payload::new(b"block".to_vec());
        assert_eq!(
            session.bind_payload(payload.clone(), ProcessId::random()),
            Ok(true)
        );
        // Binding sweeps acknowledgements of any other hash.
        assert_eq!(session.ack_count(), 0);

        // One matching acknowledgement is nowhere near the quorum of five.
        assert!(session.add_ack(payload.hash(), ack_from_fresh_signer()));
        assert_eq!(session.ack_count(), 1);
        assert!(!session.has_commit_quorum());
        assert!(session.assemble_certificate().len() == 1);
    }

    #[test]
    fn test_quorum_matches_view_snapshot() {
        let session = new_session(10);
        assert_eq!(session.quorum_size(), 7);
        assert!(!session.has_commit_quorum());
    }

    #[test]
    fn test_expiry() {
        let mut session = new_session(4);
        let now = Instant::now();
        let later = now + Duration::from_secs(60);

        assert!(!session.is_expired(now, Duration::from_secs(30), Duration::from_secs(120)));
        // Stalled past the TTL.
        assert!(session.is_expired(later, Duration::from_secs(30), Duration::from_secs(120)));

        // Delivered sessions live until the retention window passes.
        session.record_delivery();
        assert!(!session.is_expired(later, Duration::from_secs(30), Duration::from_secs(120)));
        let much_later = now + Duration::from_secs(300);
        assert!(session.is_expired(much_later, Duration::from_secs(30), Duration::from_secs(120)));
    }
}
