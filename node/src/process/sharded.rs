use std::sync::Arc;

use crate::broadcast::shard::RingShard;
use crate::config::{ConfigError, DbrbConfig};
use crate::crypto::Keypair;
use crate::process::{DbrbProcess, MessageSender, SessionStore};
use crate::view::ViewFetcher;

impl DbrbProcess {
    /// An engine that disseminates to a bounded, deterministic shard of the
    /// broadcast view instead of the whole view. Shards are sized by
    /// `config.shard_size` and clamped to the view for small views, so small
    /// deployments degrade to full-view behaviour.
    pub fn sharded(
        keypair: Arc<Keypair>,
        message_sender: Arc<dyn MessageSender>,
        view_fetcher: Arc<dyn ViewFetcher>,
        session_store: Option<Arc<dyn SessionStore>>,
        config: DbrbConfig,
    ) -> Result<DbrbProcess, ConfigError> {
        let strategy = RingShard::new(config.shard_size);
        Self::with_strategy(
            keypair,
            message_sender,
            view_fetcher,
            Box::new(strategy),
            session_store,
            config,
        )
    }
}

#[cfg(test)]
mod test {
    use parking_lot::Mutex;

    use crate::broadcast::session::SessionState;
    use crate::broadcast::{BroadcastId, Payload};
    use crate::peer::ToProcessId;
    use crate::process::test::{RecordingSender, StaticViewFetcher};
    use crate::view::ViewData;

    use super::*;

    struct RecordingStore {
        states: Mutex<Vec<(BroadcastId, SessionState)>>,
        removed: Mutex<Vec<BroadcastId>>,
    }

    impl SessionStore for RecordingStore {
        fn persist(&self, id: &BroadcastId, state: SessionState) {
            self.states.lock().push((*id, state));
        }

        fn remove(&self, id: &BroadcastId) {
            self.removed.lock().push(*id);
        }
    }

    fn sharded_process(
        shard_size: usize,
        member_count: usize,
        store: Option<Arc<dyn SessionStore>>,
    ) -> (DbrbProcess, Arc<RecordingSender>, ViewData) {
        let keypairs: Vec<_> = (0..member_count)
            .map(|_| Arc::new(Keypair::generate()))
            .collect();
        let view: ViewData = keypairs
            .iter()
            .map(|keypair| keypair.process_id())
            .collect();
        let sender = RecordingSender::new(ViewData::new());
        let fetcher = Arc::new(StaticViewFetcher {
            view: view.clone(),
            expiration_ms: u64::MAX,
            ban_ms: 0,
        });
        let config = DbrbConfig {
            shard_size,
            ..DbrbConfig::default()
        };
        let mut process =
            DbrbProcess::sharded(keypairs[0].clone(), sender.clone(), fetcher, store, config)
                .unwrap();
        process.update_view(0, 1, false);
        process.set_validation_callback(|_| true);
        (process, sender, view)
    }

    #[test]
    fn test_rejects_zero_shard_size() {
        let keypair = Arc::new(Keypair::generate());
        let sender = RecordingSender::new(ViewData::new());
        let fetcher = Arc::new(StaticViewFetcher {
            view: ViewData::new(),
            expiration_ms: u64::MAX,
            ban_ms: 0,
        });
        let config = DbrbConfig {
            shard_size: 0,
            ..DbrbConfig::default()
        };
        assert!(DbrbProcess::sharded(keypair, sender, fetcher, None, config).is_err());
    }

    #[test]
    fn test_shard_is_clamped_to_small_views() {
        let (mut process, sender, view) = sharded_process(10, 3, None);

        process.broadcast(Payload::new(b"block".to_vec()), view);
        let sent = sender.sent.lock();
        // Disseminate and the own acknowledgement, both to everyone but us.
        assert_eq!(sent.len(), 2);
        for (_, recipients) in sent.iter() {
            assert_eq!(recipients.len(), 2);
            assert!(!recipients.is_member(process.id()));
        }
    }

    #[test]
    fn test_shard_is_bounded_in_large_views() {
        let (mut process, sender, view) = sharded_process(4, 20, None);

        process.broadcast(Payload::new(b"block".to_vec()), view);
        let sent = sender.sent.lock();
        assert_eq!(sent.len(), 2);
        for (_, recipients) in sent.iter() {
            assert_eq!(recipients.len(), 4);
            assert!(!recipients.is_member(process.id()));
        }
    }

    #[test]
    fn test_session_store_sees_lifecycle() {
        let store = Arc::new(RecordingStore {
            states: Mutex::new(vec![]),
            removed: Mutex::new(vec![]),
        });
        let (mut process, _sender, view) =
            sharded_process(4, 1, Some(store.clone() as Arc<dyn SessionStore>));

        process.broadcast(Payload::new(b"block".to_vec()), view);
        let states = store.states.lock();
        assert!(!states.is_empty());
        // Single member view commits and delivers right away.
        assert_eq!(states.last().unwrap().1, SessionState::Delivered);
    }
}
