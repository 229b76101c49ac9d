//! Bidirectional kind <-> resource lookup built from discovery.

use crate::{
    discovery::{ResourceDescriptor, RestMapper},
    errors::{Error, Result},
};
use kube::core::GroupVersionKind;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub kind: String,
    pub resource: String,
    pub group: String,
    pub default_version: String,
    pub namespaced: bool,
}

impl RegistryEntry {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.default_version, &self.kind)
    }
}

/// Resolves user-facing names (`Deployment`, `deployments`,
/// `deployments.apps`) to one entry.
///
/// When a kind is served by several groups, the group discovered first wins
/// for the bare name; the qualified `resource.group` form is always exact.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
}

impl ResourceRegistry {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ResourceDescriptor>) -> Self {
        let mut registry = ResourceRegistry::default();
        for d in descriptors {
            // subresources such as `deployments/scale` are not addressable kinds
            if d.resource.contains('/') {
                continue;
            }
            let qualified = qualified_name(&d.resource, &d.group);
            if registry.index.contains_key(&qualified) {
                continue;
            }
            let idx = registry.entries.len();
            for key in [d.kind.to_lowercase(), d.resource.clone(), qualified] {
                registry.index.entry(key).or_insert(idx);
            }
            registry.entries.push(RegistryEntry {
                kind: d.kind,
                resource: d.resource,
                group: d.group,
                default_version: d.version,
                namespaced: d.namespaced,
            });
        }
        registry
    }

    /// Builds the registry from the mapper's discovery data.
    pub async fn discover(mapper: &dyn RestMapper) -> Result<Self> {
        Ok(Self::from_descriptors(mapper.discover().await?))
    }

    pub fn lookup(&self, name: &str) -> Option<&RegistryEntry> {
        let key = name.to_lowercase();
        self.index
            .get(&key)
            .or_else(|| self.index.get(name))
            .map(|idx| &self.entries[*idx])
    }

    pub fn require(&self, name: &str) -> Result<&RegistryEntry> {
        self.lookup(name).ok_or_else(|| Error::NoMatch {
            api_version: String::new(),
            kind: name.to_string(),
        })
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn qualified_name(resource: &str, group: &str) -> String {
    if group.is_empty() {
        resource.to_string()
    } else {
        format!("{}.{}", resource, group)
    }
}
