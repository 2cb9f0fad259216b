use crate::WatchError;
use futures::{prelude::*, stream::BoxStream};
use kube::{
    api::{Api, DynamicObject, ListParams, WatchParams},
    core::{ApiResource, Request},
    Client, Resource,
};
use std::{io, sync::Arc};
use watch_relay_core::ResourceKind;

/// Parameters for listing every object of a kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListRequest {
    pub resource: Arc<ResourceKind>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// A complete, consistent listing of a kind.
#[derive(Clone, Debug)]
pub struct Listing {
    /// The version to start watching from. Unset if the server did not report one.
    pub resource_version: Option<String>,
    pub items: Vec<DynamicObject>,
}

/// Parameters for a single watch request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchRequest {
    pub resource: Arc<ResourceKind>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,

    /// The version to resume from. `"0"` requests the current state followed by changes.
    pub resource_version: String,

    /// How long the server should keep the stream open.
    pub timeout_secs: u32,
}

/// Lists a kind and opens long-lived streams of line-delimited watch notifications.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync + 'static {
    async fn list(&self, req: &ListRequest) -> Result<Listing, WatchError>;

    async fn watch(
        &self,
        req: &WatchRequest,
    ) -> Result<BoxStream<'static, io::Result<String>>, WatchError>;
}

/// Watches through the Kubernetes API server.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
}

// === impl KubeWatchSource ===

impl KubeWatchSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl WatchSource for KubeWatchSource {
    async fn list(&self, req: &ListRequest) -> Result<Listing, WatchError> {
        let ar = api_resource(&req.resource);
        let mut params = ListParams::default();
        if let Some(labels) = req.label_selector.as_deref() {
            params = params.labels(labels);
        }
        if let Some(fields) = req.field_selector.as_deref() {
            params = params.fields(fields);
        }

        let list = Api::<DynamicObject>::all_with(self.client.clone(), &ar)
            .list(&params)
            .await
            .map_err(WatchError::List)?;
        Ok(Listing {
            resource_version: list.metadata.resource_version,
            items: list.items,
        })
    }

    async fn watch(
        &self,
        req: &WatchRequest,
    ) -> Result<BoxStream<'static, io::Result<String>>, WatchError> {
        let ar = api_resource(&req.resource);
        let mut params = WatchParams::default().timeout(req.timeout_secs);
        if let Some(labels) = req.label_selector.as_deref() {
            params = params.labels(labels);
        }
        if let Some(fields) = req.field_selector.as_deref() {
            params = params.fields(fields);
        }

        let request = Request::new(DynamicObject::url_path(&ar, None))
            .watch(&params, &req.resource_version)?;
        let body = self
            .client
            .request_stream(request)
            .await
            .map_err(WatchError::Connect)?;
        Ok(body.lines().boxed())
    }
}

impl std::fmt::Debug for KubeWatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWatchSource").finish_non_exhaustive()
    }
}

fn api_resource(resource: &ResourceKind) -> ApiResource {
    ApiResource {
        group: resource.group.clone(),
        version: resource.version.clone(),
        api_version: resource.api_version(),
        kind: resource.kind.clone(),
        plural: resource.plural.clone(),
    }
}
