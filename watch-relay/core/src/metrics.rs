use crate::{change::TrackedChange, store::EventStore};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{
        counter::Counter,
        family::Family,
        gauge::{ConstGauge, Gauge},
        MetricType,
    },
    registry::Registry,
};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct StoreMetrics {
    events: Family<EventLabels, Counter>,
    superseded: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct SessionMetrics {
    active: Gauge,
    connected: Counter,
    lagged: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct AccessMetrics {
    decisions: Gauge,
    queries: Counter,
    failures: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    kind: String,
    change: &'static str,
}

/// Reports the sizes of the mirror and the event log when scraped.
#[derive(Debug)]
struct Instrumented(Arc<EventStore>);

pub fn register(reg: &mut Registry, store: Arc<EventStore>) {
    reg.register_collector(Box::new(Instrumented(store)));
}

// === impl StoreMetrics ===

impl StoreMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let events = Family::default();
        reg.register(
            "events",
            "Count of changes appended to the event log",
            events.clone(),
        );

        let superseded = Counter::default();
        reg.register(
            "superseded",
            "Count of event log entries replaced by a newer state of the same object",
            superseded.clone(),
        );

        Self { events, superseded }
    }

    pub(crate) fn applied(&self, change: &TrackedChange) {
        self.events
            .get_or_create(&EventLabels {
                kind: change.resource.to_string(),
                change: change.change_type().as_str(),
            })
            .inc();
    }

    pub(crate) fn superseded(&self) {
        self.superseded.inc();
    }
}

// === impl SessionMetrics ===

impl SessionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let active = Gauge::default();
        reg.register(
            "sessions",
            "The number of connected viewer sessions",
            active.clone(),
        );

        let connected = Counter::default();
        reg.register(
            "sessions_connected",
            "Count of viewer sessions opened",
            connected.clone(),
        );

        let lagged = Counter::default();
        reg.register(
            "sessions_lagged",
            "Count of viewer sessions closed because they fell behind the event log",
            lagged.clone(),
        );

        Self {
            active,
            connected,
            lagged,
        }
    }

    pub(crate) fn connected(&self) {
        self.connected.inc();
        self.active.inc();
    }

    pub(crate) fn closed(&self) {
        self.active.dec();
    }

    pub(crate) fn lagged(&self) {
        self.lagged.inc();
    }
}

// === impl AccessMetrics ===

impl AccessMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let decisions = Gauge::default();
        reg.register(
            "access_cache_size",
            "The number of memoized access decisions",
            decisions.clone(),
        );

        let queries = Counter::default();
        reg.register(
            "access_queries",
            "Count of access checks sent to the authorizer",
            queries.clone(),
        );

        let failures = Counter::default();
        reg.register(
            "access_failures",
            "Count of access checks that failed and were treated as denials",
            failures.clone(),
        );

        Self {
            decisions,
            queries,
            failures,
        }
    }

    pub(crate) fn decisions(&self, len: usize) {
        self.decisions.set(len as i64);
    }

    pub(crate) fn queried(&self) {
        self.queries.inc();
    }

    pub(crate) fn failed(&self) {
        self.failures.inc();
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let mirror_encoder = encoder.encode_descriptor(
            "mirror_size",
            "The number of live objects in the resource mirror",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.0.mirror_len() as i64).encode(mirror_encoder)?;

        let log_encoder = encoder.encode_descriptor(
            "log_size",
            "The number of entries held in the event log",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.0.log_len() as i64).encode(log_encoder)?;

        Ok(())
    }
}
