use crate::{Relay, RelayConfig, RelayMetrics, WatchSpec};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;
use watch_relay_core::{ResourceKind, StoreConfig};
use watch_relay_k8s::{
    discover_plural, resource_kind, Client, KubeWatchSource, SubjectAccessReviewOracle,
    WatchConfig,
};

#[derive(Debug, Parser)]
#[clap(
    name = "watch-relay",
    about = "Mirrors cluster resources to many viewers, filtered by what each may see"
)]
pub struct Args {
    #[clap(long, default_value = "watch_relay=info,warn", env = "WATCH_RELAY_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// A kind to mirror: `<apiVersion> <Kind> [labels=<sel>] [fields=<sel>] [plural=<name>]`.
    ///
    /// May be repeated, once per kind.
    #[clap(long = "watch", required = true)]
    watches: Vec<WatchSpec>,

    /// A kind that every viewer may see without an access check, as `Kind.group` (or `Kind` for
    /// the core group).
    #[clap(long = "public-kind")]
    public_kinds: Vec<String>,

    #[clap(long, default_value = "60")]
    access_cache_ttl_secs: u64,

    /// The number of published changes a session may fall behind before it is closed.
    #[clap(long, default_value = "4096")]
    event_buffer: usize,

    #[clap(long, default_value = "256")]
    session_buffer: usize,

    /// The number of deletion markers and bookmarks retained in the event log.
    #[clap(long, default_value = "1024")]
    retained_markers: usize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            watches,
            public_kinds,
            access_cache_ttl_secs,
            event_buffer,
            session_buffer,
            retained_markers,
        } = self;

        let mut prom = <Registry>::default();
        let relay_reg = prom.sub_registry_with_prefix("relay");
        let metrics = RelayMetrics::register(relay_reg);
        let store = Relay::build_store(
            StoreConfig {
                event_buffer,
                retained_markers,
            },
            &metrics,
            relay_reg,
        );
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let relay = Relay::new(
            store,
            Arc::new(SubjectAccessReviewOracle::new(runtime.client())),
            RelayConfig {
                access_ttl: Duration::from_secs(access_cache_ttl_secs),
                session_buffer,
                public_kinds,
            },
            metrics,
        );

        // Spawn resource watches. Each kind's watcher owns all of that kind's mirrored objects,
        // so a kind may only be watched once.
        let source = KubeWatchSource::new(runtime.client());
        let mut watched = Vec::<Arc<ResourceKind>>::new();
        for spec in watches {
            let Some(resource) = resolve(&runtime.client(), &spec).await else {
                continue;
            };
            if watched
                .iter()
                .any(|w| w.group == resource.group && w.kind == resource.kind)
            {
                bail!("{} is watched more than once", resource);
            }
            let resource = Arc::new(resource);
            watched.push(resource.clone());
            relay.spawn_watch(
                source.clone(),
                WatchConfig {
                    resource,
                    label_selector: spec.label_selector,
                    field_selector: spec.field_selector,
                },
                runtime.shutdown_handle(),
            );
        }

        relay.spawn_sweep(runtime.shutdown_handle());

        info!("Relay started");

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        let res = runtime.run().await;
        relay.shutdown();
        if res.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Determines the plural name of a watched kind, preferring an explicit one over API discovery.
///
/// Returns `None` if the API server does not serve the kind.
async fn resolve(client: &Client, spec: &WatchSpec) -> Option<ResourceKind> {
    if let Some(plural) = spec.plural.as_deref() {
        return Some(resource_kind(&spec.api_version, &spec.kind, Some(plural)));
    }

    match discover_plural(client, &spec.api_version, &spec.kind).await {
        Ok(Some(plural)) => Some(resource_kind(
            &spec.api_version,
            &spec.kind,
            Some(&plural),
        )),
        Ok(None) => {
            tracing::warn!(
                api_version = %spec.api_version,
                kind = %spec.kind,
                "resource kind not found, skipping watches"
            );
            None
        }
        Err(error) => {
            tracing::warn!(
                api_version = %spec.api_version,
                kind = %spec.kind,
                %error,
                "API discovery failed; guessing the plural name"
            );
            Some(resource_kind(&spec.api_version, &spec.kind, None))
        }
    }
}
