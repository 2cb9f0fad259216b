use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use watch_relay_core::ResourceKind;

/// Metrics shared by all watchers, labeled by kind.
#[derive(Clone, Debug, Default)]
pub struct WatchMetrics {
    restarts: Family<KindLabels, Counter>,
    decode_errors: Family<KindLabels, Counter>,
    expired: Family<KindLabels, Counter>,
    deleted_while_unwatched: Family<KindLabels, Counter>,
    healthy: Family<KindLabels, Gauge>,
}

/// A single watcher's view of [`WatchMetrics`].
#[derive(Clone, Debug)]
pub(crate) struct KindMetrics {
    restarts: Counter,
    decode_errors: Counter,
    expired: Counter,
    deleted_while_unwatched: Counter,
    healthy: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

// === impl WatchMetrics ===

impl WatchMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let restarts = Family::default();
        reg.register(
            "watch_restarts",
            "Count of watch requests re-issued after a stream ended",
            restarts.clone(),
        );

        let decode_errors = Family::default();
        reg.register(
            "watch_decode_errors",
            "Count of watch notifications that could not be decoded",
            decode_errors.clone(),
        );

        let expired = Family::default();
        reg.register(
            "watch_expired",
            "Count of watches restarted because their resource version expired",
            expired.clone(),
        );

        let deleted_while_unwatched = Family::default();
        reg.register(
            "watch_relist_deletions",
            "Count of objects found deleted when a kind was relisted",
            deleted_while_unwatched.clone(),
        );

        let healthy = Family::default();
        reg.register(
            "watch_healthy",
            "Whether the last attempt to list or watch a kind succeeded",
            healthy.clone(),
        );

        Self {
            restarts,
            decode_errors,
            expired,
            deleted_while_unwatched,
            healthy,
        }
    }

    pub(crate) fn kind(&self, resource: &ResourceKind) -> KindMetrics {
        let labels = KindLabels {
            kind: resource.to_string(),
        };
        KindMetrics {
            restarts: self.restarts.get_or_create(&labels).clone(),
            decode_errors: self.decode_errors.get_or_create(&labels).clone(),
            expired: self.expired.get_or_create(&labels).clone(),
            deleted_while_unwatched: self.deleted_while_unwatched.get_or_create(&labels).clone(),
            healthy: self.healthy.get_or_create(&labels).clone(),
        }
    }
}

// === impl KindMetrics ===

impl KindMetrics {
    pub(crate) fn restarted(&self) {
        self.restarts.inc();
    }

    pub(crate) fn decode_error(&self) {
        self.decode_errors.inc();
    }

    pub(crate) fn expired(&self) {
        self.expired.inc();
    }

    pub(crate) fn relisted(&self, deleted: usize) {
        self.deleted_while_unwatched.inc_by(deleted as u64);
    }

    pub(crate) fn healthy(&self, healthy: bool) {
        self.healthy.set(i64::from(healthy));
    }

    #[cfg(test)]
    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.get() == 1
    }

    #[cfg(test)]
    pub(crate) fn relist_deletions(&self) -> u64 {
        self.deleted_while_unwatched.get()
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (u64, u64, u64) {
        (
            self.restarts.get(),
            self.decode_errors.get(),
            self.expired.get(),
        )
    }
}
