//! Maps documents to the REST coordinates they are served at.

use crate::{
    discovery::{GroupKind, RestMapper, SCOPE_NAMESPACE},
    document::Document,
    errors::Result,
};
use kube::{api::PropagationPolicy, core::GroupVersionKind, discovery::ApiResource};
use std::collections::HashMap;

/// Kinds whose dependents are only cleaned up reliably with background
/// propagation.
const BACKGROUND_DELETE_KINDS: &[&str] = &["Job", "CronJob"];

/// Group/version/resource/kind of a type plus its scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinates {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
}

impl Coordinates {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), &self.resource)
    }

    /// Propagation policy deletes use unless the caller picks one.
    pub fn default_propagation(&self) -> Option<PropagationPolicy> {
        if BACKGROUND_DELETE_KINDS.contains(&self.kind.as_str()) {
            Some(PropagationPolicy::Background)
        } else {
            None
        }
    }
}

/// Resolves documents through a [`RestMapper`].
///
/// Results are memoized per group/version/kind for the lifetime of the
/// resolver, which callers scope to one call chain.
pub struct Resolver<'a> {
    mapper: &'a dyn RestMapper,
    cache: HashMap<GroupVersionKind, Coordinates>,
}

impl<'a> Resolver<'a> {
    pub fn new(mapper: &'a dyn RestMapper) -> Self {
        Resolver {
            mapper,
            cache: HashMap::new(),
        }
    }

    /// Coordinates of the document's type. Empty documents fail with
    /// `EmptyDocument`.
    pub async fn resolve(&mut self, document: &Document) -> Result<Coordinates> {
        let gvk = document.gvk()?;
        self.resolve_gvk(&gvk).await
    }

    #[tracing::instrument(skip(self, gvk), fields(kind = %gvk.kind, version = %gvk.version))]
    pub async fn resolve_gvk(&mut self, gvk: &GroupVersionKind) -> Result<Coordinates> {
        if let Some(coords) = self.cache.get(gvk) {
            return Ok(coords.clone());
        }
        let mapping = self
            .mapper
            .rest_mapping(&GroupKind::new(&gvk.group, &gvk.kind), &gvk.version)
            .await?;
        let coords = Coordinates {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            resource: mapping.resource,
            kind: gvk.kind.clone(),
            namespaced: mapping.scope_name == SCOPE_NAMESPACE,
        };
        tracing::debug!(resource = %coords.resource, namespaced = coords.namespaced, "resolved");
        self.cache.insert(gvk.clone(), coords.clone());
        Ok(coords)
    }
}
