//! Watch relay core
//!
//! The relay mirrors a curated set of cluster resources and re-publishes every change to many
//! connected viewers, each of whom only receives what they are authorized to see:
//!
//! - Resource watchers decode upstream change notifications into [`TrackedChange`]s and hand them
//!   to the [`EventStore`].
//! - The [`EventStore`] owns the resource mirror (the latest state of every live object) and the
//!   event log (a single, monotonically numbered sequence of changes across all kinds). Each
//!   [`EventStore::apply`] supersedes, appends, and publishes as one atomic step.
//! - The [`Broadcaster`] tracks viewer sessions. A new session first receives a replay of the
//!   mirror, then every new log entry, each filtered through the [`AccessFilter`].
//! - The [`AccessFilter`] decides visibility with up to three authorization checks, memoized by
//!   the [`AccessCache`] in front of an [`AccessOracle`].
//!
//! ```text
//! [ watcher ]* -> [ EventStore: mirror + log ] -> [ Broadcaster ] -> [ Session ]*
//!                                                       |
//!                                      [ AccessFilter -> AccessCache -> AccessOracle ]
//! ```
//!
//! Nothing in this crate talks to a cluster; the Kubernetes-facing pieces live in
//! `watch-relay-k8s`.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
mod change;
mod identity;
pub mod metrics;
pub mod session;
mod store;
mod visibility;


pub use self::{
    access::{AccessCache, AccessOracle, AccessTarget, Subject, Verb},
    change::{ChangeEvent, ChangeType, EventId, EventLogEntry, Notification, TrackedChange},
    identity::{ResourceIdentity, ResourceKind},
    session::{Broadcaster, Session, SessionId, ViewerSession},
    store::{EventStore, StoreConfig},
    visibility::AccessFilter,
};
