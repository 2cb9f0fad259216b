use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{task::JoinHandle, time::Duration};
use tracing::{info_span, Instrument};
use watch_relay_core::{
    metrics::{AccessMetrics, SessionMetrics, StoreMetrics},
    AccessCache, AccessFilter, AccessOracle, Broadcaster, EventStore, Session, StoreConfig,
    Subject,
};
use watch_relay_k8s::{ResourceWatcher, WatchConfig, WatchMetrics, WatchSource};

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub access_ttl: Duration,
    pub session_buffer: usize,

    /// Kinds every viewer may see without an access check, as `Kind.group`.
    pub public_kinds: Vec<String>,
}

/// All of the relay's metrics. These must be registered before the runtime is built, and so
/// before the relay itself exists.
#[derive(Clone, Debug, Default)]
pub struct RelayMetrics {
    pub store: StoreMetrics,
    pub sessions: SessionMetrics,
    pub access: AccessMetrics,
    pub watch: WatchMetrics,
}

/// A handle to the relay's shared state.
///
/// Viewer transports call [`Relay::connect`] for each authenticated viewer.
#[derive(Clone, Debug)]
pub struct Relay {
    store: Arc<EventStore>,
    access: Arc<AccessCache>,
    broadcaster: Broadcaster,
    watch_metrics: WatchMetrics,
}

// === impl RelayConfig ===

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            access_ttl: AccessCache::DEFAULT_TTL,
            session_buffer: Broadcaster::DEFAULT_SESSION_BUFFER,
            public_kinds: Vec::new(),
        }
    }
}

// === impl RelayMetrics ===

impl RelayMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        Self {
            store: StoreMetrics::register(reg),
            sessions: SessionMetrics::register(reg),
            access: AccessMetrics::register(reg),
            watch: WatchMetrics::register(reg),
        }
    }
}

// === impl Relay ===

impl Relay {
    /// Builds a store and registers its size collector.
    pub fn build_store(
        config: StoreConfig,
        metrics: &RelayMetrics,
        reg: &mut Registry,
    ) -> Arc<EventStore> {
        let store = EventStore::shared(config, metrics.store.clone());
        watch_relay_core::metrics::register(reg, store.clone());
        store
    }

    pub fn new(
        store: Arc<EventStore>,
        oracle: Arc<dyn AccessOracle>,
        config: RelayConfig,
        metrics: RelayMetrics,
    ) -> Self {
        let RelayConfig {
            access_ttl,
            session_buffer,
            public_kinds,
        } = config;
        let access = Arc::new(AccessCache::new(oracle, access_ttl).with_metrics(metrics.access));
        let filter = AccessFilter::new(access.clone(), public_kinds);
        let broadcaster = Broadcaster::new(store.clone(), filter, session_buffer, metrics.sessions);
        Self {
            store,
            access,
            broadcaster,
            watch_metrics: metrics.watch,
        }
    }

    /// Opens an access-filtered session for an authenticated viewer.
    pub fn connect(&self, subject: Subject) -> Session {
        self.broadcaster.connect(subject)
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn access_cache(&self) -> &Arc<AccessCache> {
        &self.access
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Spawns a watcher that mirrors one kind until shutdown.
    pub fn spawn_watch<S: WatchSource>(
        &self,
        source: S,
        config: WatchConfig,
        drain: drain::Watch,
    ) -> JoinHandle<()> {
        let span = info_span!("watch", kind = %config.resource);
        let watcher = ResourceWatcher::new(source, config, self.store.clone(), &self.watch_metrics);
        tokio::spawn(watcher.run(drain).instrument(span))
    }

    /// Spawns the task that evicts expired access decisions until shutdown.
    pub fn spawn_sweep(&self, drain: drain::Watch) -> JoinHandle<()> {
        let shutdown = drain.signaled().map(|_release| ());
        tokio::spawn(
            self.access
                .clone()
                .sweep(shutdown)
                .instrument(info_span!("access_cache")),
        )
    }

    /// Closes every session and drops all mirrored state.
    pub fn shutdown(&self) {
        let sessions = self.broadcaster.len();
        self.broadcaster.disconnect_all();
        self.store.clear();
        tracing::info!(sessions, "Relay shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watch_relay_core::{AccessTarget, Notification, ResourceKind, TrackedChange, Verb};

    /// Grants everything to everyone except `anonymous`.
    struct Authenticated;

    #[async_trait::async_trait]
    impl AccessOracle for Authenticated {
        async fn allowed(
            &self,
            subject: &Subject,
            _: &AccessTarget,
            _: Verb,
        ) -> anyhow::Result<bool> {
            Ok(subject.user != "anonymous")
        }
    }

    fn relay(public_kinds: Vec<String>) -> Relay {
        let metrics = RelayMetrics::register(&mut Registry::default());
        let store = Relay::build_store(StoreConfig::default(), &metrics, &mut Registry::default());
        Relay::new(
            store,
            Arc::new(Authenticated),
            RelayConfig {
                public_kinds,
                ..Default::default()
            },
            metrics,
        )
    }

    async fn next(session: &mut Session) -> Option<Notification> {
        tokio::time::timeout(Duration::from_secs(1), session.recv())
            .await
            .expect("session must not stall")
    }

    #[tokio::test]
    async fn connects_viewers_to_the_store() {
        let relay = relay(vec!["FeatureGate.config.openshift.io".to_string()]);
        let gates = Arc::new(ResourceKind::new(
            "config.openshift.io",
            "v1",
            "FeatureGate",
            "featuregates",
        ));
        let pods = Arc::new(ResourceKind::new("", "v1", "Pod", "pods"));
        relay.event_store().apply(TrackedChange::added(
            gates.clone(),
            gates.identity(None, "cluster"),
            Some("1".to_string()),
            json!({ "kind": "FeatureGate", "metadata": { "name": "cluster" } }),
        ));
        relay.event_store().apply(TrackedChange::added(
            pods.clone(),
            pods.identity(Some("default".to_string()), "a"),
            Some("2".to_string()),
            json!({ "kind": "Pod", "metadata": { "name": "a", "namespace": "default" } }),
        ));

        let mut alice = relay.connect(Subject::new("alice", ["system:authenticated"]));
        let mut anonymous = relay.connect(Subject::new("anonymous", Vec::<String>::new()));

        for _ in 0..2 {
            assert!(matches!(next(&mut alice).await, Some(Notification::Replay(_))));
        }
        assert!(matches!(next(&mut alice).await, Some(Notification::Loaded)));

        // Public kinds are visible without any grant.
        let replay = next(&mut anonymous).await.unwrap();
        assert_eq!(replay.entry().unwrap().change.resource.kind, "FeatureGate");
        assert!(matches!(next(&mut anonymous).await, Some(Notification::Loaded)));
        assert_eq!(relay.broadcaster().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_and_clears_state() {
        let relay = relay(Vec::new());
        let pods = Arc::new(ResourceKind::new("", "v1", "Pod", "pods"));
        relay.event_store().apply(TrackedChange::added(
            pods.clone(),
            pods.identity(Some("default".to_string()), "a"),
            Some("1".to_string()),
            json!({ "kind": "Pod", "metadata": { "name": "a", "namespace": "default" } }),
        ));
        let mut session = relay.connect(Subject::new("alice", Vec::<String>::new()));
        assert!(matches!(next(&mut session).await, Some(Notification::Replay(_))));
        assert!(matches!(next(&mut session).await, Some(Notification::Loaded)));

        relay.shutdown();
        assert!(relay.broadcaster().is_empty());
        assert_eq!(relay.event_store().mirror_len(), 0);
        assert_eq!(relay.event_store().log_len(), 0);
        assert!(next(&mut session).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_stops_on_shutdown() {
        let relay = relay(Vec::new());
        let (signal, drain) = drain::channel();
        let sweep = relay.spawn_sweep(drain);
        tokio::time::timeout(Duration::from_secs(1), signal.drain())
            .await
            .expect("sweep must release shutdown");
        sweep.await.expect("sweep must not panic");
    }
}
