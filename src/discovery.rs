//! Discovery-backed mapping from kinds to REST resources.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use kube::{
    core::GroupVersionKind,
    discovery::{ApiCapabilities, ApiResource, Scope},
    Client, Discovery,
};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Scope name of namespaced resources.
pub const SCOPE_NAMESPACE: &str = "namespace";
/// Scope name of cluster-scoped resources.
pub const SCOPE_ROOT: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: &str, kind: &str) -> Self {
        GroupKind {
            group: group.to_string(),
            kind: kind.to_string(),
        }
    }
}

/// Where a kind is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestMapping {
    /// Plural resource name, e.g. `deployments`
    pub resource: String,
    /// Either [`SCOPE_NAMESPACE`] or [`SCOPE_ROOT`]
    pub scope_name: String,
}

/// One resource type served by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub resource: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    fn from_discovered(ar: &ApiResource, caps: &ApiCapabilities) -> Self {
        ResourceDescriptor {
            group: ar.group.clone(),
            version: ar.version.clone(),
            kind: ar.kind.clone(),
            resource: ar.plural.clone(),
            namespaced: matches!(caps.scope, Scope::Namespaced),
        }
    }
}

/// Answers "which resource serves this kind, and is it namespaced".
#[async_trait]
pub trait RestMapper: Send + Sync {
    async fn rest_mapping(&self, group_kind: &GroupKind, version: &str) -> Result<RestMapping>;

    /// All resources the cluster serves, preferred versions first.
    async fn discover(&self) -> Result<Vec<ResourceDescriptor>>;

    /// Drops cached discovery data. Call after the API surface changed.
    async fn invalidate(&self) {}
}

/// [`RestMapper`] over the cluster's discovery API.
///
/// Discovery runs on first use and is cached. A kind missing from the cache
/// triggers one refresh before the lookup fails, so CRDs installed after the
/// first lookup are found.
pub struct DiscoveryMapper {
    client: Client,
    cache: RwLock<Option<Arc<Discovery>>>,
}

impl DiscoveryMapper {
    pub fn new(client: Client) -> Self {
        DiscoveryMapper {
            client,
            cache: RwLock::new(None),
        }
    }

    async fn discovery(&self) -> Result<(Arc<Discovery>, bool)> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok((cached.clone(), true));
        }
        Ok((self.refresh().await?, false))
    }

    #[tracing::instrument(skip(self))]
    async fn refresh(&self) -> Result<Arc<Discovery>> {
        tracing::debug!("running api discovery");
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(Error::Discovery)?;
        let discovery = Arc::new(discovery);
        *self.cache.write().await = Some(discovery.clone());
        Ok(discovery)
    }
}

fn lookup(discovery: &Discovery, gvk: &GroupVersionKind) -> Option<RestMapping> {
    discovery.resolve_gvk(gvk).map(|(ar, caps)| RestMapping {
        resource: ar.plural,
        scope_name: match caps.scope {
            Scope::Namespaced => SCOPE_NAMESPACE,
            Scope::Cluster => SCOPE_ROOT,
        }
        .to_string(),
    })
}

#[async_trait]
impl RestMapper for DiscoveryMapper {
    async fn rest_mapping(&self, group_kind: &GroupKind, version: &str) -> Result<RestMapping> {
        let gvk = GroupVersionKind::gvk(&group_kind.group, version, &group_kind.kind);
        let (discovery, cached) = self.discovery().await?;
        if let Some(mapping) = lookup(&discovery, &gvk) {
            return Ok(mapping);
        }
        if cached {
            tracing::debug!(kind = %gvk.kind, "kind not in cached discovery, refreshing");
            if let Some(mapping) = lookup(&*self.refresh().await?, &gvk) {
                return Ok(mapping);
            }
        }
        Err(Error::NoMatch {
            api_version: gvk.api_version(),
            kind: gvk.kind,
        })
    }

    async fn discover(&self) -> Result<Vec<ResourceDescriptor>> {
        let (discovery, _) = self.discovery().await?;
        let mut descriptors = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                descriptors.push(ResourceDescriptor::from_discovered(&ar, &caps));
            }
        }
        Ok(descriptors)
    }

    async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
