use thiserror::Error;

use crate::peer::{ProcessId, ToProcessId};

#[derive(Error, Debug)]
pub enum KeypairError {
    #[error("Failed to sign message")]
    Signature,
    #[error("Unable to deserialize keypair: '{}'", .0)]
    Deserialization(String),
}

/// A wrapper around the libp2p keypair type.
/// libp2p internally supports different key types, we only use Ed25519.
// Careful with DEBUG, DISPLAY!!!
pub struct Keypair(libp2p_identity::Keypair);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(libp2p_identity::PublicKey);

impl Keypair {
    pub fn generate() -> Self {
        Keypair(libp2p_identity::Keypair::generate_ed25519())
    }

    pub(crate) fn as_ref(&self) -> &libp2p_identity::Keypair {
        &self.0
    }

    pub fn sign<M: AsRef<[u8]>>(&self, msg: &M) -> Result<Vec<u8>, KeypairError> {
        self.as_ref()
            .sign(msg.as_ref())
            .map_err(|_| KeypairError::Signature)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public())
    }

    pub fn to_protobuf_encoding(&self) -> Result<Vec<u8>, KeypairError> {
        self.as_ref()
            .to_protobuf_encoding()
            .map_err(|e| KeypairError::Deserialization(e.to_string()))
    }

    pub fn from_protobuf_encoding(raw: &[u8]) -> Result<Self, KeypairError> {
        let keypair = libp2p_identity::Keypair::from_protobuf_encoding(raw)
            .map_err(|e| KeypairError::Deserialization(e.to_string()))?;
        Ok(Keypair(keypair))
    }
}

impl PublicKey {
    pub fn verify<M: AsRef<[u8]>>(&self, msg: &M, signature: &[u8]) -> bool {
        self.0.verify(msg.as_ref(), signature)
    }
}

impl ToProcessId for Keypair {
    fn process_id(&self) -> ProcessId {
        ProcessId(self.0.public().to_peer_id())
    }
}

impl ToProcessId for PublicKey {
    fn process_id(&self) -> ProcessId {
        ProcessId(self.0.to_peer_id())
    }
}

/// A signature over protocol message content together with the public key
/// that produced it. The signer identity is derived from the public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub public_key: PublicKey,
    pub signature: Vec<u8>,
}

impl Certificate {
    pub(crate) fn new(public_key: PublicKey, signature: Vec<u8>) -> Self {
        Self {
            public_key,
            signature,
        }
    }

    pub fn signer(&self) -> ProcessId {
        self.public_key.process_id()
    }
}
