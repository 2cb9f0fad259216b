use crate::{
    backoff::Backoff,
    decode::{self, decode, Decoded},
    metrics::{KindMetrics, WatchMetrics},
    source::{ListRequest, WatchRequest, WatchSource},
};
use futures::prelude::*;
use rand::Rng;
use std::sync::Arc;
use tokio::time;
use watch_relay_core::{EventStore, ResourceKind};

/// Watching from this version starts from any recent state, for servers whose listings carry no
/// version.
const ANY: &str = "0";

/// Servers reject watch timeouts of 295s or more.
const WATCH_TIMEOUT_SECS: u32 = 240;
const WATCH_TIMEOUT_JITTER_SECS: u32 = 30;

/// Describes what a single watcher tracks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchConfig {
    pub resource: Arc<ResourceKind>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// Keeps a single kind's objects mirrored into the [`EventStore`].
///
/// The watcher lists the kind, replacing whatever the store held for it, and then watches from
/// the listing's version. Whenever a stream ends it re-issues the watch from the last version it
/// observed. When that version has expired it lists again, so objects deleted in the meantime are
/// removed. It only stops once shutdown is signaled.
pub struct ResourceWatcher<S> {
    source: S,
    config: WatchConfig,
    store: Arc<EventStore>,
    metrics: KindMetrics,
    backoff: Backoff,
}

/// How a single list-and-watch attempt ended.
#[derive(Debug, PartialEq, Eq)]
enum Ended {
    /// The stream delivered notifications before it ended; re-issue immediately.
    Progressed,

    /// The version expired straight after a listing; back off before listing again.
    Expired,

    /// The listing or stream could not be opened, delivered nothing, or failed.
    Failed,
}

// === impl ResourceWatcher ===

impl<S: WatchSource> ResourceWatcher<S> {
    pub fn new(
        source: S,
        config: WatchConfig,
        store: Arc<EventStore>,
        metrics: &WatchMetrics,
    ) -> Self {
        let metrics = metrics.kind(&config.resource);
        Self {
            source,
            config,
            store,
            metrics,
            backoff: Backoff::default(),
        }
    }

    pub async fn run(mut self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        tracing::info!("Watching");
        // Unset until the kind has been listed.
        let mut resource_version = None;
        let mut started = false;
        loop {
            if started {
                self.metrics.restarted();
            }
            started = true;

            let ended = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                ended = self.sync(&mut resource_version) => ended,
            };

            match ended {
                Ended::Progressed => {
                    self.backoff.reset();
                    tracing::debug!(?resource_version, "Watch ended; restarting");
                }
                Ended::Expired | Ended::Failed => {
                    let delay = self.backoff.next_delay();
                    tracing::debug!(?delay, ?ended, "Watch failed; backing off");
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = time::sleep(delay) => {}
                    }
                }
            }
        }
        tracing::info!("Watch stopped");
    }

    /// Lists the kind if no version is known, then watches from the latest known version.
    async fn sync(&self, resource_version: &mut Option<String>) -> Ended {
        let (mut version, relisted) = match resource_version.take() {
            Some(version) => (version, false),
            None => match self.relist().await {
                Some(version) => (version, true),
                None => return Ended::Failed,
            },
        };

        let ended = self.watch(&mut version).await;
        if ended == Ended::Expired {
            // Leave the version unset so that the next attempt lists again.
            tracing::debug!(%version, "Resource version expired; relisting");
            return if relisted {
                Ended::Expired
            } else {
                Ended::Progressed
            };
        }
        *resource_version = Some(version);
        ended
    }

    /// Replaces the store's view of the kind with a fresh listing, returning the version to watch
    /// from.
    async fn relist(&self) -> Option<String> {
        let req = ListRequest {
            resource: self.config.resource.clone(),
            label_selector: self.config.label_selector.clone(),
            field_selector: self.config.field_selector.clone(),
        };
        let listing = match self.source.list(&req).await {
            Ok(listing) => listing,
            Err(error) => {
                self.metrics.healthy(false);
                tracing::warn!(%error, "Failed to list");
                return None;
            }
        };
        self.metrics.healthy(true);

        let mut changes = Vec::with_capacity(listing.items.len());
        for obj in listing.items {
            match decode::listed(&self.config.resource, obj) {
                Ok(Some(change)) => changes.push(change),
                Ok(None) => tracing::debug!("Skipping listed object without a name"),
                Err(error) => {
                    self.metrics.decode_error();
                    tracing::warn!(%error, "Failed to decode listed object");
                }
            }
        }

        let listed = changes.len();
        let deleted = self.store.resync(&self.config.resource, changes);
        self.metrics.relisted(deleted);
        tracing::debug!(listed, deleted, "Listed");

        Some(listing.resource_version.unwrap_or_else(|| ANY.to_string()))
    }

    /// Runs one watch request to completion, applying its changes and tracking the version to
    /// resume from.
    async fn watch(&self, resource_version: &mut String) -> Ended {
        let req = WatchRequest {
            resource: self.config.resource.clone(),
            label_selector: self.config.label_selector.clone(),
            field_selector: self.config.field_selector.clone(),
            resource_version: resource_version.clone(),
            timeout_secs: WATCH_TIMEOUT_SECS
                + rand::thread_rng().gen_range(0..WATCH_TIMEOUT_JITTER_SECS),
        };

        let mut lines = match self.source.watch(&req).await {
            Ok(lines) => lines,
            Err(error) => {
                self.metrics.healthy(false);
                tracing::warn!(%error, "Failed to start watch");
                return Ended::Failed;
            }
        };
        self.metrics.healthy(true);
        tracing::debug!(
            resource_version = %req.resource_version,
            timeout = req.timeout_secs,
            "Watch started"
        );

        let mut progressed = false;
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    tracing::debug!(%error, "Watch stream failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            progressed = true;

            match decode(&self.config.resource, &line) {
                Ok(Decoded::Change(change)) => {
                    if let Some(version) = change.resource_version.as_ref() {
                        resource_version.clone_from(version);
                    }
                    tracing::trace!(
                        change = %change.change_type(),
                        identity = ?change.identity(),
                        "Applying"
                    );
                    self.store.apply(change);
                }
                Ok(Decoded::Skipped(reason)) => {
                    tracing::debug!(reason, "Skipping notification");
                }
                Ok(Decoded::Expired) => {
                    self.metrics.expired();
                    return Ended::Expired;
                }
                Ok(Decoded::Failed {
                    code,
                    reason,
                    message,
                }) => {
                    self.metrics.healthy(false);
                    tracing::warn!(code, %reason, %message, "Watch failed");
                    return Ended::Failed;
                }
                Err(error) => {
                    self.metrics.decode_error();
                    tracing::warn!(%error, "Failed to decode watch notification");
                }
            }
        }

        if progressed {
            Ended::Progressed
        } else {
            Ended::Failed
        }
    }
}
