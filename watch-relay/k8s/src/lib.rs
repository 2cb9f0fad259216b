//! Kubernetes plumbing for the relay: listings and raw watch streams, notification decoding,
//! per-kind watchers, and an access oracle backed by `SubjectAccessReview`.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backoff;
mod decode;
pub mod metrics;
mod oracle;
mod source;
mod watcher;


pub use self::{
    metrics::WatchMetrics,
    oracle::SubjectAccessReviewOracle,
    source::{KubeWatchSource, ListRequest, Listing, WatchRequest, WatchSource},
    watcher::{ResourceWatcher, WatchConfig},
};
pub use kube::Client;
use kube::core::{ApiResource, GroupVersionKind};
use watch_relay_core::ResourceKind;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("invalid watch request: {0}")]
    Request(#[from] kube::core::request::Error),

    #[error("failed to open watch: {0}")]
    Connect(#[source] kube::Error),

    #[error("failed to list: {0}")]
    List(#[source] kube::Error),
}

/// Describes a kind from its `apiVersion` and `kind`.
///
/// When no plural is given, it is guessed from the kind the same way kube does for custom
/// resources.
pub fn resource_kind(api_version: &str, kind: &str, plural: Option<&str>) -> ResourceKind {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    let gvk = GroupVersionKind::gvk(group, version, kind);
    let ar = match plural {
        Some(plural) => ApiResource::from_gvk_with_plural(&gvk, plural),
        None => ApiResource::from_gvk(&gvk),
    };
    ResourceKind::new(ar.group, ar.version, ar.kind, ar.plural)
}

/// Looks up a kind's plural name through API discovery.
///
/// Returns `Ok(None)` if the API group is served but does not include the kind.
pub async fn discover_plural(
    client: &Client,
    api_version: &str,
    kind: &str,
) -> kube::Result<Option<String>> {
    let resources = if api_version.contains('/') {
        client.list_api_group_resources(api_version).await?
    } else {
        client.list_core_api_resources(api_version).await?
    };
    Ok(resources
        .resources
        .into_iter()
        // Subresources (e.g. `pods/status`) share their parent's kind.
        .find(|r| r.kind == kind && !r.name.contains('/'))
        .map(|r| r.name))
}
