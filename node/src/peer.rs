use std::fmt::Display;
use std::str::FromStr;

use libp2p_identity::PeerId as Libp2pPeerId;

pub(crate) type ProcessIdType = Libp2pPeerId;

/// Identity of a single DBRB participant, derived from its public key.
///
/// The `Ord` impl gives a total order over identities which is the same on
/// every process. Shard computation depends on that order being stable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub(crate) ProcessIdType);

impl ProcessId {
    pub fn random() -> Self {
        Self(ProcessIdType::random())
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(Self(ProcessIdType::from_bytes(bytes)?))
    }

    pub fn from_base58(base58: &str) -> anyhow::Result<Self> {
        let id = ProcessIdType::from_str(base58)
            .map_err(|e| anyhow::anyhow!("Invalid process id: {e}"))?;
        Ok(Self(id))
    }
}

impl From<Libp2pPeerId> for ProcessId {
    fn from(peer_id: Libp2pPeerId) -> Self {
        Self(peer_id)
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait ToProcessId {
    fn process_id(&self) -> ProcessId;
}
