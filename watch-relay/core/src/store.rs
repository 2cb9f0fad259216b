//! The resource mirror and the event log.
//!
//! Both structures live behind a single lock and are only ever mutated together, through
//! [`EventStore::apply`]. The mirror maps each live object to the log entry holding its latest
//! state, so that at any point the mirror enumerates exactly the live objects and each of them
//! has exactly one live log entry.

use crate::{
    change::{ChangeEvent, EventId, EventLogEntry, TrackedChange},
    identity::{ResourceIdentity, ResourceKind},
    metrics::StoreMetrics,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};
use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// The number of published entries a subscriber may fall behind before it is considered
    /// lagged.
    pub event_buffer: usize,

    /// The number of deletion markers and bookmarks kept in the log after publication.
    pub retained_markers: usize,
}

#[derive(Debug)]
pub struct EventStore {
    state: RwLock<State>,
    events: broadcast::Sender<Arc<EventLogEntry>>,
    retained_markers: usize,
    metrics: StoreMetrics,
}

#[derive(Debug, Default)]
struct State {
    /// The last assigned id. Ids start at 1.
    last_id: u64,

    log: BTreeMap<EventId, Arc<EventLogEntry>>,
    mirror: HashMap<ResourceIdentity, MirrorEntry>,

    /// Deletion markers and bookmarks, oldest first.
    markers: VecDeque<EventId>,
}

#[derive(Debug)]
struct MirrorEntry {
    event_id: EventId,
    resource_version: Option<String>,
}

// === impl StoreConfig ===

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            event_buffer: 4096,
            retained_markers: 1024,
        }
    }
}

// === impl EventStore ===

impl EventStore {
    pub fn new(config: StoreConfig, metrics: StoreMetrics) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            state: RwLock::new(State::default()),
            events,
            retained_markers: config.retained_markers,
            metrics,
        }
    }

    pub fn shared(config: StoreConfig, metrics: StoreMetrics) -> Arc<Self> {
        Arc::new(Self::new(config, metrics))
    }

    /// Records a change in the log, updating the mirror and publishing the new entry to all
    /// subscribers.
    ///
    /// If the object's previous state is still in the log, that entry is superseded (removed)
    /// before the new one is appended. A change that carries the same resource version as the
    /// mirrored state is not recorded again; its existing entry's id is returned instead.
    pub fn apply(&self, change: TrackedChange) -> EventId {
        let mut state = self.state.write();
        self.apply_locked(&mut state, change)
    }

    /// Replaces a kind's mirrored objects with a complete listing of that kind.
    ///
    /// Every listed object is applied as with [`EventStore::apply`]. Mirrored objects of the kind
    /// that are missing from the listing were deleted while the kind was not being watched, and a
    /// deletion is recorded for each. Returns the number of such deletions. The whole update is
    /// one atomic step, so sessions never observe a partially resynced kind.
    pub fn resync(&self, resource: &Arc<ResourceKind>, listed: Vec<TrackedChange>) -> usize {
        let mut state = self.state.write();

        let mut live = HashSet::with_capacity(listed.len());
        for change in listed {
            if let Some(identity) = change.identity() {
                live.insert(identity.clone());
            }
            self.apply_locked(&mut state, change);
        }

        let mut stale = state
            .mirror
            .keys()
            .filter(|id| id.group == resource.group && id.kind == resource.kind)
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect::<Vec<_>>();
        stale.sort_unstable();
        for identity in &stale {
            tracing::debug!(%identity, "Deleted while unwatched");
            self.apply_locked(
                &mut state,
                TrackedChange::deleted(resource.clone(), identity.clone(), None),
            );
        }
        stale.len()
    }

    fn apply_locked(&self, state: &mut State, change: TrackedChange) -> EventId {
        let change_type = change.change_type();
        match change.event {
            ChangeEvent::Bookmark => {
                self.metrics.applied(&change);
                let id = state.append(change, &self.events);
                state.retain_marker(id, self.retained_markers);
                id
            }

            ChangeEvent::Added { ref identity, .. }
            | ChangeEvent::Modified { ref identity, .. } => {
                let identity = identity.clone();
                if let Some(prior) = state.mirror.get(&identity) {
                    if prior.resource_version.is_some()
                        && prior.resource_version == change.resource_version
                    {
                        tracing::trace!(%identity, id = %prior.event_id, "unchanged");
                        return prior.event_id;
                    }
                    let superseded = prior.event_id;
                    state.log.remove(&superseded);
                    self.metrics.superseded();
                    tracing::trace!(%identity, %superseded, "superseded");
                }

                let resource_version = change.resource_version.clone();
                self.metrics.applied(&change);
                let id = state.append(change, &self.events);
                state.mirror.insert(
                    identity,
                    MirrorEntry {
                        event_id: id,
                        resource_version,
                    },
                );
                tracing::trace!(%id, change = %change_type, "applied");
                id
            }

            ChangeEvent::Deleted { ref identity } => {
                if let Some(MirrorEntry { event_id, .. }) = state.mirror.remove(identity) {
                    state.log.remove(&event_id);
                    tracing::trace!(%identity, superseded = %event_id, "removed");
                }

                self.metrics.applied(&change);
                let id = state.append(change, &self.events);
                state.retain_marker(id, self.retained_markers);
                id
            }
        }
    }

    /// Returns the log entry with the given id, if it is still held.
    pub fn get(&self, id: EventId) -> Option<Arc<EventLogEntry>> {
        self.state.read().log.get(&id).cloned()
    }

    /// Returns the mirror's live entries in log order.
    pub fn snapshot(&self) -> Vec<Arc<EventLogEntry>> {
        self.state.read().snapshot()
    }

    /// Returns the mirror's live entries along with a receiver for every entry appended after
    /// them.
    ///
    /// Both are taken under the same lock so that no entry is missed or seen twice.
    pub fn subscribe(&self) -> (Vec<Arc<EventLogEntry>>, broadcast::Receiver<Arc<EventLogEntry>>) {
        let state = self.state.read();
        let rx = self.events.subscribe();
        (state.snapshot(), rx)
    }

    /// Returns the id of the log entry holding the object's latest state.
    pub fn lookup(&self, identity: &ResourceIdentity) -> Option<EventId> {
        self.state.read().mirror.get(identity).map(|e| e.event_id)
    }

    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        self.state.read().mirror.contains_key(identity)
    }

    pub fn mirror_len(&self) -> usize {
        self.state.read().mirror.len()
    }

    pub fn log_len(&self) -> usize {
        self.state.read().log.len()
    }

    /// Drops all mirrored state. Ids continue from where they left off.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.log.clear();
        state.mirror.clear();
        state.markers.clear();
    }
}

// === impl State ===

impl State {
    /// Assigns the next id to a change, records it in the log, and publishes it.
    ///
    /// Publication happens under the write lock, so subscribers observe entries in id order.
    fn append(
        &mut self,
        change: TrackedChange,
        events: &broadcast::Sender<Arc<EventLogEntry>>,
    ) -> EventId {
        self.last_id += 1;
        let id = EventId(self.last_id);
        let entry = Arc::new(EventLogEntry { id, change });
        self.log.insert(id, entry.clone());
        // Sending only fails when there are no subscribers.
        let _ = events.send(entry);
        id
    }

    fn retain_marker(&mut self, id: EventId, capacity: usize) {
        self.markers.push_back(id);
        while self.markers.len() > capacity {
            if let Some(evicted) = self.markers.pop_front() {
                self.log.remove(&evicted);
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<EventLogEntry>> {
        let mut ids = self.mirror.values().map(|e| e.event_id).collect::<Vec<_>>();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.log.get(&id).cloned())
            .collect()
    }
}
