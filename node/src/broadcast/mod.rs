//! Sharded reliable broadcast where participating processes go through three
//! message rounds to agree on delivering a payload.
//!
//! DISSEMINATE:
//!     1. The originator sends the payload to its shard, a bounded subset of
//!        the broadcast view. Every receiver relays it to its own shard, so the
//!        payload floods the reachable membership with bounded fan-out per hop.
//! ACKNOWLEDGED:
//!     1. A process that accepts the payload signs an acknowledgement and sends
//!        it to its shard. Acknowledgements it has not seen before are relayed
//!        the same way.
//! COMMIT:
//!     1. When a process holds `n - f` distinct acknowledgements it assembles
//!        them into a quorum certificate and sends a COMMIT to its shard.
//!     2. A process receiving a valid COMMIT certificate commits immediately,
//!        delivers the payload exactly once and relays the COMMIT onward.
//!
//! Limitations:
//! - Different broadcasts are not ordered relative to each other. Every
//!   broadcast reaches quorum independently.
//! - A session that makes no progress is abandoned after a TTL, it is never
//!   retried by the engine itself.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use crate::crypto::Certificate;
use crate::peer::ProcessId;
use crate::utilities::encoding;
use crate::utilities::hash::{blake2_256, Hash};

pub(crate) mod quorum;
pub(crate) mod session;
pub(crate) mod shard;
pub(crate) mod signing;

pub use session::SessionState;

/// An immutable, opaque blob being broadcast. Identity is its content hash.
#[derive(Clone, Debug)]
pub struct Payload {
    bytes: Arc<Vec<u8>>,
    hash: Hash,
}

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hash = blake2_256(&bytes);
        Payload {
            bytes: Arc::new(bytes),
            hash,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Payload {}

/// Unique name of one broadcast attempt, derived from the originator, the
/// payload content hash and a per-broadcast nonce.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BroadcastId(Hash);

impl BroadcastId {
    pub fn derive(originator: &ProcessId, payload_hash: &Hash, nonce: u64) -> Self {
        let mut buffer = originator.as_bytes();
        buffer.extend_from_slice(payload_hash.as_ref());
        buffer.extend_from_slice(&nonce.to_be_bytes());
        BroadcastId(blake2_256(&buffer))
    }

    pub(crate) fn as_hash(&self) -> &Hash {
        &self.0
    }
}

impl Display for BroadcastId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", encoding::to_base58(self.0))
    }
}

/// Acknowledgement signatures collected for one broadcast, keyed by signer.
pub type QuorumCertificate = BTreeMap<ProcessId, Certificate>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Disseminate,
    Acknowledged,
    Commit,
}

impl MessageKind {
    /// Domain separation tag used when signing message content.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            MessageKind::Disseminate => 1,
            MessageKind::Acknowledged => 2,
            MessageKind::Commit => 3,
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Disseminate => write!(f, "DISSEMINATE"),
            MessageKind::Acknowledged => write!(f, "ACKNOWLEDGED"),
            MessageKind::Commit => write!(f, "COMMIT"),
        }
    }
}

/// Protocol messages. Wire encoding is owned by the transport, the engine
/// only deals with the decoded form.
#[derive(Clone, Debug)]
pub enum Message {
    Disseminate {
        id: BroadcastId,
        originator: ProcessId,
        nonce: u64,
        payload: Payload,
        /// Originator signature, carried unchanged through relays.
        certificate: Certificate,
    },
    Acknowledged {
        id: BroadcastId,
        payload_hash: Hash,
        certificate: Certificate,
    },
    Commit {
        id: BroadcastId,
        payload_hash: Hash,
        /// Sender signature over the commit itself.
        certificate: Certificate,
        quorum_certificate: QuorumCertificate,
    },
}

impl Message {
    pub fn id(&self) -> &BroadcastId {
        match self {
            Message::Disseminate { id, .. }
            | Message::Acknowledged { id, .. }
            | Message::Commit { id, .. } => id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Disseminate { .. } => MessageKind::Disseminate,
            Message::Acknowledged { .. } => MessageKind::Acknowledged,
            Message::Commit { .. } => MessageKind::Commit,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_broadcast_id_deterministic() {
        let originator = ProcessId::random();
        let payload = Payload::new(b"block".to_vec());
        let id = BroadcastId::derive(&originator, &payload.hash(), 7);
        assert_eq!(id, BroadcastId::derive(&originator, &payload.hash(), 7));
        assert_ne!(id, BroadcastId::derive(&originator, &payload.hash(), 8));

        let other = Payload::new(b"other block".to_vec());
        assert_ne!(id, BroadcastId::derive(&originator, &other.hash(), 7));
    }

    #[test]
    fn test_payload_identity_is_content_hash() {
        let a = Payload::new(b"block".to_vec());
        let b = Payload::new(b"block".to_vec());
        let c = Payload::new(b"other".to_vec());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
