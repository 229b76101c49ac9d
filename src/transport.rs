//! The seam between the handler and the API server.

use crate::errors::Result;
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{
        Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams,
    },
    core::DynamicObject,
    discovery::ApiResource,
    Client,
};

/// Resource type plus namespace a request is addressed to.
/// `namespace: None` addresses the cluster scope.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub resource: ApiResource,
    pub namespace: Option<String>,
}

/// One page of a list response.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<DynamicObject>,
    /// Token for the next page; `None` on the last page.
    pub continue_token: Option<String>,
}

pub type EventStream = BoxStream<'static, Result<WatchEvent<DynamicObject>>>;

/// Executes requests against the cluster.
///
/// Implementations must honor `dry_run` on every mutating call, and the
/// stream returned by `watch` must end when the server closes the watch.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create(
        &self,
        endpoint: &Endpoint,
        params: &PostParams,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    async fn replace(
        &self,
        endpoint: &Endpoint,
        name: &str,
        params: &PostParams,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// `data` is the JSON-encoded object carrying the new status.
    async fn replace_status(
        &self,
        endpoint: &Endpoint,
        name: &str,
        params: &PostParams,
        data: Vec<u8>,
    ) -> Result<DynamicObject>;

    async fn delete(&self, endpoint: &Endpoint, name: &str, params: &DeleteParams) -> Result<()>;

    async fn get(&self, endpoint: &Endpoint, name: &str) -> Result<DynamicObject>;

    async fn list(&self, endpoint: &Endpoint, params: &ListParams) -> Result<Page>;

    async fn watch(
        &self,
        endpoint: &Endpoint,
        params: &WatchParams,
        resource_version: &str,
    ) -> Result<EventStream>;

    async fn patch(
        &self,
        endpoint: &Endpoint,
        name: &str,
        params: &PatchParams,
        patch: &Patch<serde_json::Value>,
    ) -> Result<DynamicObject>;
}

/// [`Transport`] over `kube::Api<DynamicObject>`.
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self {
        KubeTransport { client }
    }

    fn api(&self, endpoint: &Endpoint) -> Api<DynamicObject> {
        match endpoint.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &endpoint.resource),
            None => Api::all_with(self.client.clone(), &endpoint.resource),
        }
    }
}

#[async_trait]
impl Transport for KubeTransport {
    async fn create(
        &self,
        endpoint: &Endpoint,
        params: &PostParams,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        Ok(self.api(endpoint).create(params, obj).await?)
    }

    async fn replace(
        &self,
        endpoint: &Endpoint,
        name: &str,
        params: &PostParams,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        Ok(self.api(endpoint).replace(name, params, obj).await?)
    }

    async fn replace_status(
        &self,
        endpoint: &Endpoint,
        name: &str,
        params: &PostParams,
        data: Vec<u8>,
    ) -> Result<DynamicObject> {
        Ok(self.api(endpoint).replace_status(name, params, data).await?)
    }

    async fn delete(&self, endpoint: &Endpoint, name: &str, params: &DeleteParams) -> Result<()> {
        self.api(endpoint).delete(name, params).await?;
        Ok(())
    }

    async fn get(&self, endpoint: &Endpoint, name: &str) -> Result<DynamicObject> {
        Ok(self.api(endpoint).get(name).await?)
    }

    async fn list(&self, endpoint: &Endpoint, params: &ListParams) -> Result<Page> {
        let list = self.api(endpoint).list(params).await?;
        Ok(Page {
            items: list.items,
            continue_token: list.metadata.continue_.filter(|token| !token.is_empty()),
        })
    }

    async fn watch(
        &self,
        endpoint: &Endpoint,
        params: &WatchParams,
        resource_version: &str,
    ) -> Result<EventStream> {
        let stream = self.api(endpoint).watch(params, resource_version).await?;
        Ok(stream.map_err(Into::into).boxed())
    }

    async fn patch(
        &self,
        endpoint: &Endpoint,
        name: &str,
        params: &PatchParams,
        patch: &Patch<serde_json::Value>,
    ) -> Result<DynamicObject> {
        Ok(self.api(endpoint).patch(name, params, patch).await?)
    }
}
