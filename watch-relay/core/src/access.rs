//! Memoized authorization checks.
//!
//! Every event is checked once per connected viewer, so the same question ("may this subject
//! list pods?") is asked many times in quick succession. The [`AccessCache`] answers repeated
//! questions from memory for a short time and ensures that concurrent askers share a single
//! outstanding query to the [`AccessOracle`].

use crate::{
    identity::{ResourceIdentity, ResourceKind},
    metrics::AccessMetrics,
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::time::{self, Duration, Instant};

/// An authenticated viewer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subject {
    pub user: String,
    pub groups: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
}

/// The resource attributes of an authorization check.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessTarget {
    pub group: String,

    /// The lowercased plural resource name.
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// Answers whether a subject may perform a verb on a target.
#[async_trait::async_trait]
pub trait AccessOracle: Send + Sync + 'static {
    async fn allowed(&self, subject: &Subject, target: &AccessTarget, verb: Verb) -> Result<bool>;
}

pub struct AccessCache {
    oracle: Arc<dyn AccessOracle>,
    ttl: Duration,
    decisions: Mutex<Decisions>,
    metrics: AccessMetrics,
}

#[derive(Default)]
struct Decisions {
    by_key: HashMap<Key, Decision>,
    next_generation: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Key {
    subject: Subject,
    target: AccessTarget,
    verb: Verb,
}

struct Decision {
    cached_at: Instant,
    generation: u64,

    /// Resolves to `None` when the oracle failed.
    allowed: Shared<BoxFuture<'static, Option<bool>>>,
}

// === impl Subject ===

impl Subject {
    pub fn new(user: impl ToString, groups: impl IntoIterator<Item = impl ToString>) -> Self {
        Self {
            user: user.to_string(),
            groups: groups.into_iter().map(|g| g.to_string()).collect(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user)
    }
}

// === impl Verb ===

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl AccessTarget ===

impl AccessTarget {
    /// Targets every object of a kind, in all namespaces.
    pub fn cluster(kind: &ResourceKind) -> Self {
        Self {
            group: kind.group.clone(),
            resource: kind.plural.clone(),
            namespace: None,
            name: None,
        }
    }

    /// Targets every object of a kind within a namespace.
    pub fn namespace(kind: &ResourceKind, namespace: impl ToString) -> Self {
        Self {
            group: kind.group.clone(),
            resource: kind.plural.clone(),
            namespace: Some(namespace.to_string()),
            name: None,
        }
    }

    /// Targets a single object.
    ///
    /// A `Namespace` is authorized as an object within itself.
    pub fn object(kind: &ResourceKind, identity: &ResourceIdentity) -> Self {
        let namespace = match identity.namespace {
            Some(ref ns) => Some(ns.clone()),
            None if kind.is_namespace() => Some(identity.name.clone()),
            None => None,
        };
        Self {
            group: kind.group.clone(),
            resource: kind.plural.clone(),
            namespace,
            name: Some(identity.name.clone()),
        }
    }
}

impl fmt::Display for AccessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)?;
        if !self.group.is_empty() {
            write!(f, ".{}", self.group)?;
        }
        if let Some(ref ns) = self.namespace {
            write!(f, " namespace={ns}")?;
        }
        if let Some(ref name) = self.name {
            write!(f, " name={name}")?;
        }
        Ok(())
    }
}

// === impl AccessCache ===

impl AccessCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new(oracle: Arc<dyn AccessOracle>, ttl: Duration) -> Self {
        Self {
            oracle,
            ttl,
            decisions: Mutex::new(Decisions::default()),
            metrics: AccessMetrics::default(),
        }
    }

    pub fn with_metrics(self, metrics: AccessMetrics) -> Self {
        Self { metrics, ..self }
    }

    pub fn shared(oracle: Arc<dyn AccessOracle>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(oracle, ttl))
    }

    /// Returns whether the subject may perform the verb on the target.
    ///
    /// Decisions are reused for the cache's TTL. Failed queries are treated as denials and are
    /// not cached.
    pub async fn is_allowed(&self, subject: &Subject, target: &AccessTarget, verb: Verb) -> bool {
        let key = Key {
            subject: subject.clone(),
            target: target.clone(),
            verb,
        };

        let (generation, allowed) = {
            let mut decisions = self.decisions.lock();
            match decisions.by_key.get(&key) {
                Some(d) if d.cached_at.elapsed() < self.ttl => (d.generation, d.allowed.clone()),
                _ => {
                    let generation = decisions.next_generation;
                    decisions.next_generation += 1;
                    let allowed = self.query(key.clone());
                    decisions.by_key.insert(
                        key.clone(),
                        Decision {
                            cached_at: Instant::now(),
                            generation,
                            allowed: allowed.clone(),
                        },
                    );
                    self.metrics.decisions(decisions.by_key.len());
                    (generation, allowed)
                }
            }
        };

        match allowed.await {
            Some(allowed) => allowed,
            None => {
                // Let the next caller retry rather than serve the failure for a full TTL.
                let mut decisions = self.decisions.lock();
                if decisions
                    .by_key
                    .get(&key)
                    .map(|d| d.generation == generation)
                    .unwrap_or(false)
                {
                    decisions.by_key.remove(&key);
                    self.metrics.decisions(decisions.by_key.len());
                }
                false
            }
        }
    }

    /// Drops decisions that have outlived the TTL, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut decisions = self.decisions.lock();
        let before = decisions.by_key.len();
        let ttl = self.ttl;
        decisions.by_key.retain(|_, d| d.cached_at.elapsed() < ttl);
        self.metrics.decisions(decisions.by_key.len());
        before - decisions.by_key.len()
    }

    /// Periodically evicts expired decisions until `shutdown` completes.
    pub async fn sweep(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut interval = time::interval(self.ttl.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = self.evict_expired();
                    if evicted > 0 {
                        tracing::debug!(evicted, "Evicted expired access decisions");
                    }
                }
                _ = &mut shutdown => return,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.decisions.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn query(&self, key: Key) -> Shared<BoxFuture<'static, Option<bool>>> {
        let oracle = self.oracle.clone();
        let metrics = self.metrics.clone();
        metrics.queried();
        async move {
            let Key {
                subject,
                target,
                verb,
            } = key;
            match oracle.allowed(&subject, &target, verb).await {
                Ok(allowed) => {
                    tracing::debug!(%subject, %target, %verb, allowed, "Access checked");
                    Some(allowed)
                }
                Err(error) => {
                    metrics.failed();
                    tracing::warn!(%subject, %target, %verb, %error, "Access check failed");
                    None
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl fmt::Debug for AccessCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCache")
            .field("ttl", &self.ttl)
            .field("decisions", &self.len())
            .finish()
    }
}
