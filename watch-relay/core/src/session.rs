//! Viewer sessions.
//!
//! Each session is served by its own delivery task, which replays the mirror, emits the
//! `LOADED` marker, and then forwards live log entries in order. All filtering and all writes to
//! the viewer happen on that task, so a slow or stalled viewer only ever holds up itself. A
//! session that falls too far behind the log is closed; its viewer is expected to reconnect and
//! receive a fresh replay.

use crate::{
    access::Subject,
    change::{EventLogEntry, Notification},
    metrics::SessionMetrics,
    store::EventStore,
    visibility::AccessFilter,
};
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::SystemTime,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::AbortHandle,
};
use tracing::{info_span, Instrument};

pub type SessionId = u64;

/// Describes a connected viewer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewerSession {
    pub id: SessionId,
    pub subject: Subject,
    pub connected_at: SystemTime,
}

/// Tracks connected sessions and fans log entries out to them.
#[derive(Clone, Debug)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

/// The viewer's end of a session: an ordered stream of notifications.
///
/// Dropping the session disconnects it.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    rx: mpsc::Receiver<Notification>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<EventStore>,
    filter: AccessFilter,
    sessions: Mutex<HashMap<SessionId, Registered>>,
    next_id: AtomicU64,
    session_buffer: usize,
    metrics: SessionMetrics,
}

#[derive(Debug)]
struct Registered {
    session: ViewerSession,
    task: AbortHandle,
}

/// Why a delivery task stopped.
#[derive(Debug)]
enum Closed {
    Disconnected,
    Lagged(u64),
    Shutdown,
}

// === impl Broadcaster ===

impl Broadcaster {
    pub const DEFAULT_SESSION_BUFFER: usize = 256;

    pub fn new(
        store: Arc<EventStore>,
        filter: AccessFilter,
        session_buffer: usize,
        metrics: SessionMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                filter,
                sessions: Mutex::new(HashMap::default()),
                next_id: AtomicU64::new(1),
                session_buffer: session_buffer.max(1),
                metrics,
            }),
        }
    }

    /// Opens a session for the subject.
    ///
    /// The session first receives every mirrored object the subject may see, then
    /// [`Notification::Loaded`], then live changes. Must be called from within a Tokio runtime.
    pub fn connect(&self, subject: Subject) -> Session {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.session_buffer);
        let (snapshot, events) = self.inner.store.subscribe();
        let session = ViewerSession {
            id,
            subject: subject.clone(),
            connected_at: SystemTime::now(),
        };

        // Hold the registry lock while spawning so that a task which finishes immediately cannot
        // deregister before it is registered.
        let mut sessions = self.inner.sessions.lock();
        let inner = self.inner.clone();
        let task = tokio::spawn(
            async move {
                tracing::info!(replay = snapshot.len(), "Session connected");
                let closed = deliver(&inner.filter, &subject, snapshot, events, tx).await;
                match closed {
                    Closed::Lagged(skipped) => {
                        inner.metrics.lagged();
                        tracing::warn!(skipped, "Session fell behind the event log; closing");
                    }
                    Closed::Disconnected => tracing::info!("Session disconnected"),
                    Closed::Shutdown => tracing::debug!("Event log closed"),
                }
                if inner.sessions.lock().remove(&id).is_some() {
                    inner.metrics.closed();
                }
            }
            .instrument(info_span!("session", id, user = %session.subject)),
        );
        sessions.insert(
            id,
            Registered {
                session,
                task: task.abort_handle(),
            },
        );
        self.inner.metrics.connected();

        Session { id, rx }
    }

    /// Closes a session. Returns false if it was not connected.
    pub fn disconnect(&self, id: SessionId) -> bool {
        match self.inner.sessions.lock().remove(&id) {
            Some(Registered { task, .. }) => {
                task.abort();
                self.inner.metrics.closed();
                tracing::info!(id, "Session closed");
                true
            }
            None => false,
        }
    }

    /// Closes every session.
    pub fn disconnect_all(&self) {
        let sessions = std::mem::take(&mut *self.inner.sessions.lock());
        for (_, Registered { task, .. }) in sessions {
            task.abort();
            self.inner.metrics.closed();
        }
    }

    pub fn sessions(&self) -> Vec<ViewerSession> {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .values()
            .map(|r| r.session.clone())
            .collect::<Vec<_>>();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn deliver(
    filter: &AccessFilter,
    subject: &Subject,
    snapshot: Vec<Arc<EventLogEntry>>,
    mut events: broadcast::Receiver<Arc<EventLogEntry>>,
    tx: mpsc::Sender<Notification>,
) -> Closed {
    for entry in snapshot {
        if filter.is_visible(subject, &entry.change).await
            && tx.send(Notification::Replay(entry)).await.is_err()
        {
            return Closed::Disconnected;
        }
    }
    if tx.send(Notification::Loaded).await.is_err() {
        return Closed::Disconnected;
    }

    loop {
        let entry = tokio::select! {
            biased;
            _ = tx.closed() => return Closed::Disconnected,
            res = events.recv() => match res {
                Ok(entry) => entry,
                Err(broadcast::error::RecvError::Lagged(skipped)) => return Closed::Lagged(skipped),
                Err(broadcast::error::RecvError::Closed) => return Closed::Shutdown,
            },
        };

        if filter.is_visible(subject, &entry.change).await {
            tracing::trace!(id = %entry.id, "Delivering");
            if tx.send(Notification::Event(entry)).await.is_err() {
                return Closed::Disconnected;
            }
        }
    }
}

// === impl Session ===

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Receives the next notification. Returns `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Stream for Session {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Notification>> {
        self.rx.poll_recv(cx)
    }
}
