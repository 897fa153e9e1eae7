use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;

use crate::broadcast::session::{BroadcastSession, SessionState};
use crate::broadcast::shard::{FullView, ShardStrategy};
use crate::broadcast::signing::MessageSigner;
use crate::broadcast::{BroadcastId, Message, MessageKind, Payload, QuorumCertificate};
use crate::config::{ConfigError, DbrbConfig};
use crate::crypto::{Certificate, Keypair};
use crate::peer::{ProcessId, ToProcessId};
use crate::utilities::hash::Hash;
use crate::view::{ViewData, ViewFetcher};

pub mod runner;
mod sharded;

/// Per-message failures. They are logged and never escape `process_message`;
/// the engine stays live for all other sessions.
#[derive(Error, Debug)]
pub enum DbrbError {
    #[error("conflicting payload for broadcast {id}")]
    EquivocationDetected { id: BroadcastId },
    #[error("acknowledgement for unknown broadcast {id}")]
    UnknownSession { id: BroadcastId },
    #[error("invalid signature from {signer}")]
    InvalidSignature { signer: ProcessId },
    #[error("sender is not a member of the broadcast view")]
    InvalidSender,
    #[error("local process is not a member of the broadcast view")]
    NotViewMember,
    #[error("broadcast id does not match originator and payload")]
    InvalidBroadcastId,
    #[error("commit certificate for broadcast {id} is below quorum")]
    InsufficientCertificate { id: BroadcastId },
}

/// Transport boundary. Delivery is fire and forget; the transport owns retry
/// and backoff, and per-recipient failures never abort a broadcast because
/// relay based propagation tolerates individual link failures.
pub trait MessageSender: Send + Sync {
    fn enqueue(&self, message: Message, recipients: &ViewData);

    /// The subset of `view` currently known to be unreachable. The transport
    /// must only report members it has actually failed to reach.
    fn unreachable_nodes(&self, view: &ViewData) -> ViewData;
}

/// Optional hook for crash recovery of session state. The engine only
/// notifies it, it never reads sessions back during normal operation.
pub trait SessionStore: Send + Sync {
    fn persist(&self, id: &BroadcastId, state: SessionState);
    fn remove(&self, id: &BroadcastId);
}

type ValidationCallback = Box<dyn Fn(&Payload) -> bool + Send>;
type DeliverCallback = Box<dyn Fn(Payload) + Send>;
type RegistrationCallback = Box<dyn Fn() + Send>;

const SESSION_CACHE_SIZE: usize = 1000;

/// The broadcast engine. One instance per participant, owning its identity,
/// its cached live view and the table of in-flight broadcast sessions.
///
/// All mutation happens through `&mut self`; the runner module funnels
/// concurrent traffic through a single mailbox so inbound messages never race
/// on session state.
pub struct DbrbProcess {
    keypair: Arc<Keypair>,
    id: ProcessId,
    message_sender: Arc<dyn MessageSender>,
    view_fetcher: Arc<dyn ViewFetcher>,
    strategy: Box<dyn ShardStrategy>,
    signer: MessageSigner,
    sessions: LruCache<BroadcastId, BroadcastSession>,
    current_view: ViewData,
    bootstrap: ViewData,
    validation_callback: ValidationCallback,
    deliver_callback: DeliverCallback,
    registration_callback: Option<RegistrationCallback>,
    session_store: Option<Arc<dyn SessionStore>>,
    config: DbrbConfig,
}

impl DbrbProcess {
    /// An engine that disseminates to the whole pruned view.
    pub fn full_view(
        keypair: Arc<Keypair>,
        message_sender: Arc<dyn MessageSender>,
        view_fetcher: Arc<dyn ViewFetcher>,
        config: DbrbConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_strategy(
            keypair,
            message_sender,
            view_fetcher,
            Box::new(FullView),
            None,
            config,
        )
    }

    pub(crate) fn with_strategy(
        keypair: Arc<Keypair>,
        message_sender: Arc<dyn MessageSender>,
        view_fetcher: Arc<dyn ViewFetcher>,
        strategy: Box<dyn ShardStrategy>,
        session_store: Option<Arc<dyn SessionStore>>,
        config: DbrbConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let bootstrap = config
            .bootstrap_processes
            .iter()
            .map(|raw| {
                ProcessId::from_base58(raw).map_err(|_| ConfigError::InvalidBootstrapId(raw.clone()))
            })
            .collect::<Result<ViewData, ConfigError>>()?;

        let id = keypair.process_id();
        Ok(DbrbProcess {
            signer: MessageSigner::new(keypair.clone()),
            keypair,
            id,
            message_sender,
            view_fetcher,
            strategy,
            sessions: LruCache::new(NonZeroUsize::new(SESSION_CACHE_SIZE).unwrap()),
            current_view: ViewData::new(),
            bootstrap,
            // No default acceptance policy: reject everything until the
            // application registers its own.
            validation_callback: Box::new(|_| false),
            deliver_callback: Box::new(|_| {}),
            registration_callback: None,
            session_store,
            config,
        })
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn current_view(&self) -> &ViewData {
        &self.current_view
    }

    pub fn shard_size(&self) -> usize {
        self.config.shard_size
    }

    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    pub fn set_validation_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Payload) -> bool + Send + 'static,
    {
        self.validation_callback = Box::new(callback);
    }

    pub fn set_deliver_callback<F>(&mut self, callback: F)
    where
        F: Fn(Payload) + Send + 'static,
    {
        self.deliver_callback = Box::new(callback);
    }

    /// Called when `update_view` decides the process should (re)register
    /// itself in the membership, e.g. by sending a registration transaction.
    pub fn set_registration_callback<F>(&mut self, callback: F)
    where
        F: Fn() + Send + 'static,
    {
        self.registration_callback = Some(Box::new(callback));
    }

    /// Refresh the cached live view from the view fetcher. In-flight sessions
    /// keep their snapshots, only future broadcasts see the new membership.
    /// Returns whether the local process is a member of the refreshed view.
    pub fn update_view(&mut self, now_ms: u64, height: u64, register_self: bool) -> bool {
        let mut view = self.view_fetcher.view_at(now_ms);
        let is_registered = view.is_member(&self.id);
        let is_bootstrap = self.bootstrap.is_member(&self.id);

        view.merge(&self.bootstrap);
        if view.is_empty() {
            log::error!("No DBRB processes in the view at height {height}");
            return false;
        }

        self.current_view = view;
        log::debug!(
            "Current view ({}) at height {height} is now set to {}",
            self.current_view.len(),
            self.current_view
        );

        if register_self {
            let mut registration_required = false;
            if !is_registered && !is_bootstrap {
                if self.view_fetcher.ban_period(&self.id) == 0 {
                    log::debug!("Process is not registered in the DBRB system");
                    registration_required = true;
                }
            } else if is_registered {
                let expiration = self.view_fetcher.expiration_time(&self.id);
                let grace_start = expiration.saturating_sub(self.config.registration_grace_ms);
                if now_ms >= grace_start {
                    log::debug!("Process registration in the DBRB system soon expires");
                    registration_required = true;
                }
            }

            if registration_required {
                if let Some(callback) = &self.registration_callback {
                    callback();
                }
            }
        }

        is_registered || is_bootstrap
    }

    /// Remove exactly the transport-reported unreachable members from `view`.
    /// Never removes the local process and never prunes speculatively.
    pub fn prune_unreachable(&self, view: &ViewData) -> ViewData {
        let unreachable = self.message_sender.unreachable_nodes(view);
        let mut pruned = view.clone();
        for id in unreachable.iter() {
            if id != &self.id {
                pruned.remove(id);
            }
        }
        pruned
    }

    /// Start a broadcast as originator. Creates exactly one session and
    /// disseminates the payload to our shard of `recipients`; never blocks.
    /// A broadcast that cannot start is logged and dropped, not an error.
    pub fn broadcast(&mut self, payload: Payload, recipients: ViewData) {
        let broadcast_view = self.prune_unreachable(&recipients);
        if broadcast_view.is_empty() {
            log::debug!("BROADCAST: broadcast view is empty, aborting broadcast");
            return;
        }
        if !recipients.is_subset(&self.current_view) {
            log::debug!(
                "BROADCAST: {recipients} is not a subview of the current view {}, aborting broadcast",
                self.current_view
            );
            return;
        }
        if !broadcast_view.is_member(&self.id) {
            log::debug!("BROADCAST: not a member of the broadcast view, aborting broadcast");
            return;
        }

        let nonce: u64 = rand::random();
        let id = BroadcastId::derive(&self.id, &payload.hash(), nonce);
        if self.sessions.contains(&id) {
            log::debug!("BROADCAST: broadcast {id} already exists, aborting broadcast");
            return;
        }

        let disseminate_cert = match self.signer.sign(MessageKind::Disseminate, &id, &payload.hash())
        {
            Ok(certificate) => certificate,
            Err(e) => {
                log::error!("BROADCAST: failed to sign broadcast {id}: {e}");
                return;
            }
        };
        let ack_cert = match self.signer.sign(MessageKind::Acknowledged, &id, &payload.hash()) {
            Ok(certificate) => certificate,
            Err(e) => {
                log::error!("BROADCAST: failed to sign acknowledgement for {id}: {e}");
                return;
            }
        };

        let shard = self.strategy.targets(&id, &broadcast_view, &self.id);
        let mut session = BroadcastSession::new(id, broadcast_view, shard.clone());
        session.bind_payload(payload.clone(), self.id).ok();
        session.advance(SessionState::Disseminated);
        session.mark_acked();
        session.add_ack(payload.hash(), ack_cert.clone());
        session.advance(SessionState::AckCollecting);
        self.persist(&id, session.state());
        self.sessions.put(id, session);

        log::debug!(
            "BROADCAST: payload {} as broadcast {id} to {shard}",
            payload.hash()
        );
        let payload_hash = payload.hash();
        self.disseminate(
            Message::Disseminate {
                id,
                originator: self.id,
                nonce,
                payload,
                certificate: disseminate_cert,
            },
            &shard,
        );
        self.disseminate(
            Message::Acknowledged {
                id,
                payload_hash,
                certificate: ack_cert,
            },
            &shard,
        );

        // A single-member view has quorum right away.
        self.try_commit(&id);
    }

    /// Route an inbound protocol message to its session, creating one on
    /// demand for `Disseminate`/`Commit`. Failures are local to the message.
    pub fn process_message(&mut self, message: Message) {
        let id = *message.id();
        let kind = message.kind();
        log::trace!("Received {kind} message for broadcast {id}");

        let result = match message {
            Message::Disseminate {
                id,
                originator,
                nonce,
                payload,
                certificate,
            } => self.on_disseminate(id, originator, nonce, payload, certificate),
            Message::Acknowledged {
                id,
                payload_hash,
                certificate,
            } => self.on_acknowledged(id, payload_hash, certificate),
            Message::Commit {
                id,
                payload_hash,
                certificate,
                quorum_certificate,
            } => self.on_commit(id, payload_hash, certificate, quorum_certificate),
        };

        if let Err(e) = result {
            match e {
                DbrbError::EquivocationDetected { .. }
                | DbrbError::InvalidSignature { .. }
                | DbrbError::InvalidSender
                | DbrbError::InsufficientCertificate { .. } => {
                    log::warn!("{kind}: message for broadcast {id} REJECTED: {e}");
                }
                DbrbError::UnknownSession { .. }
                | DbrbError::NotViewMember
                | DbrbError::InvalidBroadcastId => {
                    log::debug!("{kind}: aborting message processing ({e})");
                }
            }
        }
    }

    fn on_disseminate(
        &mut self,
        id: BroadcastId,
        originator: ProcessId,
        nonce: u64,
        payload: Payload,
        certificate: Certificate,
    ) -> Result<(), DbrbError> {
        if BroadcastId::derive(&originator, &payload.hash(), nonce) != id {
            return Err(DbrbError::InvalidBroadcastId);
        }
        if certificate.signer() != originator {
            return Err(DbrbError::InvalidSender);
        }
        self.signer
            .verify(MessageKind::Disseminate, &id, &payload.hash(), &certificate)
            .map_err(|_| DbrbError::InvalidSignature { signer: originator })?;

        if !self.sessions.contains(&id) {
            let snapshot = self.prune_unreachable(&self.current_view);
            if !snapshot.is_member(&self.id) {
                return Err(DbrbError::NotViewMember);
            }
            if !snapshot.is_member(&originator) {
                return Err(DbrbError::InvalidSender);
            }
            let shard = self.strategy.targets(&id, &snapshot, &self.id);
            let session = BroadcastSession::new(id, snapshot, shard);
            self.persist(&id, session.state());
            self.sessions.put(id, session);
        }

        let session = match self.sessions.get_mut(&id) {
            Some(session) => session,
            None => return Ok(()),
        };
        if session.is_committed() && session.payload().is_some() {
            // Replay of a settled broadcast, stay quiet.
            return Ok(());
        }
        match session.bind_payload(payload.clone(), originator) {
            Err(_) => return Err(DbrbError::EquivocationDetected { id }),
            // Duplicate dissemination triggers no additional sends.
            Ok(false) => return Ok(()),
            Ok(true) => {}
        }
        session.advance(SessionState::Disseminated);
        let shard = session.shard_snapshot.clone();
        let commit_pending = session.has_pending_commit();

        let accepted = (self.validation_callback)(&payload);
        let mut ack_message = None;
        if accepted {
            session.mark_acked();
            if !commit_pending {
                // Vouch for the payload towards the rest of the overlay.
                match self.signer.sign(MessageKind::Acknowledged, &id, &payload.hash()) {
                    Ok(ack_cert) => {
                        session.add_ack(payload.hash(), ack_cert.clone());
                        session.advance(SessionState::AckCollecting);
                        ack_message = Some(Message::Acknowledged {
                            id,
                            payload_hash: payload.hash(),
                            certificate: ack_cert,
                        });
                    }
                    Err(e) => {
                        log::error!("DISSEMINATE: failed to sign acknowledgement for {id}: {e}");
                    }
                }
            }
        } else {
            log::debug!(
                "DISSEMINATE: payload {} of broadcast {id} rejected by validation, relaying without acknowledgement",
                payload.hash()
            );
        }

        // Relay the payload onward no matter what the local validation said,
        // so a rejecting process does not cut the overlay apart.
        self.disseminate(
            Message::Disseminate {
                id,
                originator,
                nonce,
                payload,
                certificate,
            },
            &shard,
        );
        if let Some(message) = ack_message {
            self.disseminate(message, &shard);
        }

        if commit_pending {
            self.apply_pending_commit(&id);
        } else {
            self.try_commit(&id);
        }
        Ok(())
    }

    fn on_acknowledged(
        &mut self,
        id: BroadcastId,
        payload_hash: Hash,
        certificate: Certificate,
    ) -> Result<(), DbrbError> {
        let signer = certificate.signer();
        let session = match self.sessions.get_mut(&id) {
            Some(session) => session,
            // An acknowledgement should never precede its dissemination;
            // harmless anomaly, drop it.
            None => return Err(DbrbError::UnknownSession { id }),
        };
        if session.is_committed() {
            return Ok(());
        }
        if let Some(expected) = session.expected_payload_hash() {
            if expected != payload_hash {
                return Err(DbrbError::EquivocationDetected { id });
            }
        }
        if !session.view_snapshot.is_member(&signer) {
            return Err(DbrbError::InvalidSender);
        }
        if session.has_ack(&signer) {
            // Replayed acknowledgement, already counted.
            return Ok(());
        }
        self.signer
            .verify(MessageKind::Acknowledged, &id, &payload_hash, &certificate)
            .map_err(|_| DbrbError::InvalidSignature { signer })?;

        session.add_ack(payload_hash, certificate.clone());
        session.advance(SessionState::AckCollecting);
        let shard = session.shard_snapshot.clone();
        log::trace!(
            "ACKNOWLEDGED: broadcast {id} has {} of {} acknowledgements",
            session.ack_count(),
            session.quorum_size()
        );

        // Relay acknowledgements we have not seen before, so every member
        // eventually observes a quorum even with bounded fan-out.
        self.disseminate(
            Message::Acknowledged {
                id,
                payload_hash,
                certificate,
            },
            &shard,
        );
        self.try_commit(&id);
        Ok(())
    }

    fn on_commit(
        &mut self,
        id: BroadcastId,
        payload_hash: Hash,
        certificate: Certificate,
        quorum_certificate: QuorumCertificate,
    ) -> Result<(), DbrbError> {
        if let Some(session) = self.sessions.peek(&id) {
            if session.is_committed() {
                return Ok(());
            }
            if let Some(bound) = session.payload_hash() {
                if bound != payload_hash {
                    return Err(DbrbError::EquivocationDetected { id });
                }
            }
        }

        // Commitment may outrun dissemination, but a session is only created
        // once the certificates check out. Forged commits must not be able to
        // churn the session table.
        let sender = certificate.signer();
        self.signer
            .verify(MessageKind::Commit, &id, &payload_hash, &certificate)
            .map_err(|_| DbrbError::InvalidSignature { signer: sender })?;

        let snapshot = if self.sessions.contains(&id) {
            None
        } else {
            let snapshot = self.prune_unreachable(&self.current_view);
            if !snapshot.is_member(&self.id) {
                return Err(DbrbError::NotViewMember);
            }
            Some(snapshot)
        };
        {
            let view = match (&snapshot, self.sessions.peek(&id)) {
                (Some(snapshot), _) => snapshot,
                (None, Some(session)) => &session.view_snapshot,
                (None, None) => return Ok(()),
            };
            if quorum_certificate.len() < ViewData::quorum_of(view.len()) {
                return Err(DbrbError::InsufficientCertificate { id });
            }
            for ack_signer in quorum_certificate.keys() {
                if !view.is_member(ack_signer) {
                    return Err(DbrbError::InvalidSender);
                }
            }
        }
        for (ack_signer, ack_certificate) in &quorum_certificate {
            self.signer
                .verify(MessageKind::Acknowledged, &id, &payload_hash, ack_certificate)
                .map_err(|_| DbrbError::InvalidSignature { signer: *ack_signer })?;
        }

        if let Some(snapshot) = snapshot {
            let shard = self.strategy.targets(&id, &snapshot, &self.id);
            let session = BroadcastSession::new(id, snapshot, shard);
            self.persist(&id, session.state());
            self.sessions.put(id, session);
        }

        let session = match self.sessions.get_mut(&id) {
            Some(session) => session,
            None => return Ok(()),
        };
        if session.payload().is_none() {
            log::debug!("COMMIT: payload of broadcast {id} not yet known, holding certificate");
            session.set_pending_commit(payload_hash, quorum_certificate);
            return Ok(());
        }

        self.finalize_commit(&id, payload_hash, quorum_certificate);
        Ok(())
    }

    /// Local quorum path: commit once enough distinct acknowledgements piled
    /// up for a session whose payload is known.
    fn try_commit(&mut self, id: &BroadcastId) {
        let session = match self.sessions.get_mut(id) {
            Some(session) => session,
            None => return,
        };
        if session.is_committed() || !session.has_commit_quorum() {
            return;
        }
        let payload_hash = match session.payload_hash() {
            Some(hash) => hash,
            None => return,
        };
        let quorum_certificate = session.assemble_certificate();
        log::debug!(
            "Acknowledgement quorum of {} reached for broadcast {id}",
            quorum_certificate.len()
        );
        self.finalize_commit(id, payload_hash, quorum_certificate);
    }

    /// A commit certificate arrived before the payload; apply it now that
    /// the payload is bound.
    fn apply_pending_commit(&mut self, id: &BroadcastId) {
        let session = match self.sessions.get_mut(id) {
            Some(session) => session,
            None => return,
        };
        let (payload_hash, quorum_certificate) = match session.take_pending_commit() {
            Some(pending) => pending,
            None => return,
        };
        match session.payload_hash() {
            Some(bound) if bound == payload_hash => {}
            _ => {
                log::warn!("COMMIT: held certificate for broadcast {id} does not match the payload");
                return;
            }
        }
        self.finalize_commit(id, payload_hash, quorum_certificate);
    }

    /// Commit, deliver exactly once and relay the commit to our shard.
    fn finalize_commit(
        &mut self,
        id: &BroadcastId,
        payload_hash: Hash,
        quorum_certificate: QuorumCertificate,
    ) {
        let commit_cert = match self.signer.sign(MessageKind::Commit, id, &payload_hash) {
            Ok(certificate) => certificate,
            Err(e) => {
                log::error!("COMMIT: failed to sign commit for broadcast {id}: {e}");
                return;
            }
        };

        let session = match self.sessions.get_mut(id) {
            Some(session) => session,
            None => return,
        };
        if session.is_committed() {
            return;
        }
        session.accept_certificate(quorum_certificate.clone());
        session.advance(SessionState::Committed);
        let shard = session.shard_snapshot.clone();
        let payload = session.payload().cloned();
        let originator = session.originator().copied();
        // A process whose validation rejected the payload commits and relays
        // but never hands the payload to the application.
        let deliver = session.acked() && session.record_delivery();
        if deliver {
            session.advance(SessionState::Delivered);
        }
        let state = session.state();
        self.persist(id, state);

        if deliver {
            if let Some(payload) = payload {
                log::debug!(
                    "Delivering payload {} of broadcast {id} from {:?}",
                    payload.hash(),
                    originator
                );
                (self.deliver_callback)(payload);
            }
        }

        self.disseminate(
            Message::Commit {
                id: *id,
                payload_hash,
                certificate: commit_cert,
                quorum_certificate,
            },
            &shard,
        );
    }

    fn disseminate(&self, message: Message, recipients: &ViewData) {
        if recipients.is_empty() {
            return;
        }
        log::trace!(
            "Disseminating {} message for broadcast {} to {recipients}",
            message.kind(),
            message.id()
        );
        self.message_sender.enqueue(message, recipients);
    }

    fn persist(&self, id: &BroadcastId, state: SessionState) {
        if let Some(store) = &self.session_store {
            store.persist(id, state);
        }
    }

    /// Drop delivered sessions past the retention window and report stalled
    /// ones abandoned after the TTL. The engine never retries them itself.
    pub fn retire_expired(&mut self, now: Instant) {
        let ttl = Duration::from_millis(self.config.session_ttl_ms);
        let retention = Duration::from_millis(self.config.retention_ms);
        let expired: Vec<BroadcastId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_expired(now, ttl, retention))
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(session) = self.sessions.pop(&id) {
                if session.delivered() {
                    log::debug!("Retiring delivered broadcast {id}");
                } else {
                    log::warn!(
                        "Abandoning undelivered broadcast {id} in state {:?}",
                        session.state()
                    );
                }
                if let Some(store) = &self.session_store {
                    store.remove(&id);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn session(&mut self, id: &BroadcastId) -> Option<&BroadcastSession> {
        self.sessions.get(id)
    }
}
