use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;

use crate::broadcast::{BroadcastId, MessageKind};
use crate::crypto::{Certificate, Keypair};
use crate::peer::ProcessId;
use crate::utilities::encoding;
use crate::utilities::hash::Hash;

/// Bytes a certificate signs: the message kind tag binds the signature to one
/// protocol round, the broadcast id and payload hash bind it to one payload.
#[derive(Serialize)]
struct SignableMessage {
    kind: u8,
    broadcast_id: String,
    payload_hash: String,
}

fn signable_bytes(
    kind: MessageKind,
    id: &BroadcastId,
    payload_hash: &Hash,
) -> anyhow::Result<Vec<u8>> {
    encoding::encode(SignableMessage {
        kind: kind.tag(),
        broadcast_id: encoding::to_hex(id.as_hash()),
        payload_hash: encoding::to_hex(payload_hash),
    })
}

pub(crate) struct MessageSigner {
    /// Signers whose certificates already verified, per broadcast, round and
    /// payload hash. A verification over one hash must never vouch for
    /// another.
    verified: LruCache<BroadcastId, HashSet<(MessageKind, ProcessId, Hash)>>,
    /// Our own keypair
    signing_keypair: Arc<Keypair>,
}

impl MessageSigner {
    pub(crate) fn new(keypair: Arc<Keypair>) -> Self {
        Self {
            verified: LruCache::new(NonZeroUsize::new(1000).unwrap()),
            signing_keypair: keypair,
        }
    }

    pub(crate) fn sign(
        &self,
        kind: MessageKind,
        id: &BroadcastId,
        payload_hash: &Hash,
    ) -> anyhow::Result<Certificate> {
        let bytes = signable_bytes(kind, id, payload_hash)?;
        let signature = self.signing_keypair.sign(&bytes)?;
        Ok(Certificate::new(
            self.signing_keypair.public_key(),
            signature,
        ))
    }

    pub(crate) fn verify(
        &mut self,
        kind: MessageKind,
        id: &BroadcastId,
        payload_hash: &Hash,
        certificate: &Certificate,
    ) -> anyhow::Result<()> {
        let signer = certificate.signer();
        if self
            .verified
            .get(id)
            .map(|signers| signers.contains(&(kind, signer, *payload_hash)))
            .unwrap_or(false)
        {
            log::trace!("Certificate already verified: {kind} {id} from {signer}");
            return Ok(());
        }

        let bytes = signable_bytes(kind, id, payload_hash)?;
        if certificate.public_key.verify(&bytes, &certificate.signature) {
            self.verified
                .get_or_insert_mut(*id, HashSet::new)
                .insert((kind, signer, *payload_hash));
            Ok(())
        } else {
            anyhow::bail!("Invalid {kind} signature from {signer}")
        }
    }
}

#[cfg(test)]
mod test {
    use crate::broadcast::Payload;

    use super::*;

    fn signer_for(keypair: Arc<Keypair>) -> (MessageSigner, BroadcastId, Hash) {
        use crate::peer::ToProcessId;

        let payload = Payload::new(b"block".to_vec());
        let id = BroadcastId::derive(&keypair.process_id(), &payload.hash(), 1);
        (MessageSigner::new(keypair), id, payload.hash())
    }

    #[test]
    fn test_sign_verify_ok() {
        let keypair = Arc::new(Keypair::generate());
        let (mut signer, id, hash) = signer_for(keypair);

        let certificate = signer.sign(MessageKind::Acknowledged, &id, &hash).unwrap();
        assert!(signer
            .verify(MessageKind::Acknowledged, &id, &hash, &certificate)
            .is_ok());
        // Cached second verification.
        assert!(signer
            .verify(MessageKind::Acknowledged, &id, &hash, &certificate)
            .is_ok());
    }

    #[test]
    fn test_sign_verify_fail_on_other_payload() {
        let keypair = Arc::new(Keypair::generate());
        let (mut signer, id, hash) = signer_for(keypair);

        let certificate = signer.sign(MessageKind::Acknowledged, &id, &hash).unwrap();
        let other = Payload::new(b"other block".to_vec());
        assert!(signer
            .verify(MessageKind::Acknowledged, &id, &other.hash(), &certificate)
            .is_err());
    }

    #[test]
    fn test_cache_is_bound_to_payload_hash() {
        let keypair = Arc::new(Keypair::generate());
        let (mut signer, id, hash) = signer_for(keypair.clone());

        let certificate = signer.sign(MessageKind::Acknowledged, &id, &hash).unwrap();
        assert!(signer
            .verify(MessageKind::Acknowledged, &id, &hash, &certificate)
            .is_ok());

        // A garbage signature from the same signer over another hash must not
        // ride the cache entry of the genuine verification.
        let other = Payload::new(b"other block".to_vec());
        let garbage = Certificate::new(keypair.public_key(), vec![0u8; 64]);
        assert!(signer
            .verify(MessageKind::Acknowledged, &id, &other.hash(), &garbage)
            .is_err());
    }

    #[test]
    fn test_kind_is_domain_separated() {
        let keypair = Arc::new(Keypair::generate());
        let (mut signer, id, hash) = signer_for(keypair);

        let certificate = signer.sign(MessageKind::Acknowledged, &id, &hash).unwrap();
        assert!(signer
            .verify(MessageKind::Commit, &id, &hash, &certificate)
            .is_err());
    }
}
