//! Wires the relay together: command-line configuration, the kubert runtime, the Kubernetes
//! watchers and authorizer, and the shared [`Relay`] handle through which viewers connect.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use watch_relay_core as core;
pub use watch_relay_k8s as k8s;

mod args;
mod relay;
mod watch_spec;

pub use self::{
    args::Args,
    relay::{Relay, RelayConfig, RelayMetrics},
    watch_spec::{ParseWatchError, WatchSpec},
};
