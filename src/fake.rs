//! In-memory cluster used by the unit tests.


use crate::{
    discovery::{GroupKind, ResourceDescriptor, RestMapper, RestMapping, SCOPE_NAMESPACE, SCOPE_ROOT},
    errors::{Error, ErrorClass, Result},
    patch::{PatchKind, PatchRequest},
    transport::{Endpoint, EventStream, Page, Transport},
};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams},
    core::{DynamicObject, ErrorResponse},
    discovery::ApiResource,
};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// group, version, kind, resource, namespaced
const TYPES: &[(&str, &str, &str, &str, bool)] = &[
    ("", "v1", "Pod", "pods", true),
    ("", "v1", "ConfigMap", "configmaps", true),
    ("", "v1", "Service", "services", true),
    ("", "v1", "Namespace", "namespaces", false),
    ("", "v1", "Node", "nodes", false),
    ("apps", "v1", "Deployment", "deployments", true),
    ("apps", "v1", "Scale", "deployments/scale", true),
    ("batch", "v1", "Job", "jobs", true),
    ("batch", "v1", "CronJob", "cronjobs", true),
    ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", true),
    ("networking.k8s.io", "v1", "Ingress", "ingresses", true),
    ("networking.k8s.io", "v1", "NetworkPolicy", "networkpolicies", true),
    ("example.io", "v1", "Widget", "widgets", true),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Replace,
    ReplaceStatus,
    Delete,
    Get,
    List,
    Watch,
    Patch,
}

type Key = (String, String, String);

struct Watcher {
    resource: String,
    namespace: Option<String>,
    label_selector: Option<String>,
    field_selector: Option<String>,
    tx: mpsc::UnboundedSender<Result<WatchEvent<DynamicObject>>>,
}

impl Watcher {
    fn wants(&self, resource: &str, obj: &Value) -> bool {
        self.resource == resource
            && self
                .namespace
                .as_deref()
                .map_or(true, |ns| namespace_of(obj) == ns)
            && selected(obj, self.label_selector.as_deref(), self.field_selector.as_deref())
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    resource_version: u64,
    watchers: Vec<Watcher>,
    calls: Vec<Verb>,
    failures: VecDeque<(Verb, u16, String)>,
    last_delete: Option<DeleteParams>,
    last_list: Option<ListParams>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn record(&mut self, verb: Verb) -> Result<()> {
        self.calls.push(verb);
        if let Some(idx) = self.failures.iter().position(|(v, ..)| *v == verb) {
            if let Some((_, code, reason)) = self.failures.remove(idx) {
                return Err(Error::status(code, &reason, "injected failure"));
            }
        }
        Ok(())
    }

    fn broadcast(&mut self, resource: &str, obj: &Value, make: fn(DynamicObject) -> WatchEvent<DynamicObject>) {
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if watcher.wants(resource, obj) {
                if let Ok(dynamic) = serde_json::from_value(obj.clone()) {
                    let _ = watcher.tx.send(Ok(make(dynamic)));
                }
            }
        }
    }

    fn existing(&self, key: &Key) -> Result<Value> {
        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(&key.0, &key.2))
    }
}

/// Fake API server plus discovery.
///
/// Objects are stored as JSON keyed by resource, namespace and name. Watches
/// replay `Added` for every matching object on subscribe, like a watch from
/// resource version `0`.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    lookups: AtomicUsize,
}

fn resource_key(ar: &ApiResource) -> String {
    if ar.group.is_empty() {
        ar.plural.clone()
    } else {
        format!("{}.{}", ar.plural, ar.group)
    }
}

fn key(endpoint: &Endpoint, name: &str) -> Key {
    (
        resource_key(&endpoint.resource),
        endpoint.namespace.clone().unwrap_or_default(),
        name.to_string(),
    )
}

fn not_found(resource: &str, name: &str) -> Error {
    Error::status(404, "NotFound", format!("{} {:?} not found", resource, name))
}

fn metadata(obj: &mut Value) -> &mut Map<String, Value> {
    if !obj.get("metadata").map_or(false, Value::is_object) {
        obj["metadata"] = Value::Object(Map::new());
    }
    match obj.get_mut("metadata") {
        Some(Value::Object(meta)) => meta,
        _ => unreachable!("metadata was just set to an object"),
    }
}

fn meta_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get("metadata")?.get(field)?.as_str()
}

fn namespace_of(obj: &Value) -> &str {
    meta_str(obj, "namespace").unwrap_or_default()
}

fn to_object(value: Value) -> Result<DynamicObject> {
    Ok(serde_json::from_value(value)?)
}

impl FakeCluster {
    pub fn new() -> Self {
        FakeCluster::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Stores an object directly, bypassing the call log. The resource is
    /// derived from `apiVersion`/`kind`.
    pub fn insert(&self, mut obj: Value) -> Value {
        let api_version = obj["apiVersion"].as_str().unwrap_or_default().to_string();
        let (group, _) = crate::document::split_api_version(&api_version);
        let kind = obj["kind"].as_str().unwrap_or_default();
        let &(group, _, _, resource, _) = TYPES
            .iter()
            .find(|t| t.0 == group && t.2 == kind)
            .expect("kind known to the fake cluster");
        let resource = if group.is_empty() {
            resource.to_string()
        } else {
            format!("{}.{}", resource, group)
        };
        let name = meta_str(&obj, "name").expect("object has a name").to_string();
        let namespace = namespace_of(&obj).to_string();

        let mut state = self.state();
        let rv = state.next_version();
        let meta = metadata(&mut obj);
        meta.insert("resourceVersion".into(), Value::String(rv.clone()));
        meta.entry("uid").or_insert_with(|| Value::String(format!("uid-{}", rv)));
        let added = !state
            .objects
            .contains_key(&(resource.clone(), namespace.clone(), name.clone()));
        state
            .objects
            .insert((resource.clone(), namespace, name), obj.clone());
        if added {
            state.broadcast(&resource, &obj, WatchEvent::Added);
        } else {
            state.broadcast(&resource, &obj, WatchEvent::Modified);
        }
        obj
    }

    /// Stored object, if any. `resource` is `plural` or `plural.group`.
    pub fn object(&self, resource: &str, namespace: &str, name: &str) -> Option<Value> {
        self.state()
            .objects
            .get(&(resource.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn objects(&self, resource: &str) -> Vec<Value> {
        self.state()
            .objects
            .iter()
            .filter(|((r, _, _), _)| r == resource)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<Verb> {
        self.state().calls.clone()
    }

    pub fn count(&self, verb: Verb) -> usize {
        self.state().calls.iter().filter(|v| **v == verb).count()
    }

    /// Makes the next call of `verb` fail with the given status.
    pub fn fail_next(&self, verb: Verb, code: u16, reason: &str) {
        self.state()
            .failures
            .push_back((verb, code, reason.to_string()));
    }

    pub fn last_delete(&self) -> Option<DeleteParams> {
        self.state().last_delete.clone()
    }

    pub fn last_list(&self) -> Option<ListParams> {
        self.state().last_list.clone()
    }

    /// Number of `rest_mapping` calls served so far.
    pub fn mapping_lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn watcher_count(&self) -> usize {
        let mut state = self.state();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    /// Ends every open watch stream, as a server-side timeout would.
    pub fn disconnect_watchers(&self) {
        self.state().watchers.clear();
    }

    /// Sends an `Error` event to every watcher.
    pub fn send_error_event(&self, code: u16) {
        for watcher in &self.state().watchers {
            let _ = watcher.tx.send(Ok(WatchEvent::Error(ErrorResponse {
                status: "Failure".to_string(),
                message: "too old resource version".to_string(),
                reason: "Expired".to_string(),
                code,
            })));
        }
    }

    /// Sends a failed item to every watcher without closing the stream.
    pub fn send_stream_error(&self) {
        for watcher in &self.state().watchers {
            let _ = watcher
                .tx
                .send(Err(Error::status(500, "InternalError", "stream broken")));
        }
    }
}

#[async_trait]
impl Transport for FakeCluster {
    async fn create(
        &self,
        endpoint: &Endpoint,
        params: &PostParams,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state();
        state.record(Verb::Create)?;
        let mut value = serde_json::to_value(obj)?;
        let name = match (meta_str(&value, "name"), meta_str(&value, "generateName")) {
            (Some(name), _) => name.to_string(),
            (None, Some(prefix)) => format!("{}{:05x}", prefix, state.resource_version + 1),
            (None, None) => {
                return Err(Error::status(
                    422,
                    "Invalid",
                    "metadata.name or metadata.generateName is required",
                ))
            }
        };
        let key = key(endpoint, &name);
        if state.objects.contains_key(&key) {
            return Err(Error::status(
                409,
                "AlreadyExists",
                format!("{} {:?} already exists", key.0, name),
            ));
        }
        let rv = state.next_version();
        let meta = metadata(&mut value);
        meta.insert("name".into(), Value::String(name));
        if let Some(ns) = &endpoint.namespace {
            meta.insert("namespace".into(), Value::String(ns.clone()));
        }
        meta.insert("resourceVersion".into(), Value::String(rv.clone()));
        meta.insert("uid".into(), Value::String(format!("uid-{}", rv)));
        if !params.dry_run {
            state.objects.insert(key.clone(), value.clone());
            state.broadcast(&key.0, &value, WatchEvent::Added);
        }
        to_object(value)
    }

    async fn replace(
        &self,
        endpoint: &Endpoint,
        name: &str,
        params: &PostParams,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut state = self.state();
        state.record(Verb::Replace)?;
        let key = key(endpoint, name);
        let current = state.existing(&key)?;
        let mut value = serde_json::to_value(obj)?;
        if let Some(expected) = meta_str(&value, "resourceVersion") {
            if Some(expected) != meta_str(&current, "resourceVersion") {
                return Err(Error::status(
                    409,
                    "Conflict",
                    "the object has been modified; please apply your changes to the latest version",
                ));
            }
        }
        let rv = state.next_version();
        let uid = current["metadata"]["uid"].clone();
        let meta = metadata(&mut value);
        meta.insert("resourceVersion".into(), Value::String(rv));
        meta.insert("uid".into(), uid);
        if let Some(ns) = &endpoint.namespace {
            meta.insert("namespace".into(), Value::String(ns.clone()));
        }
        if !params.dry_run {
            state.objects.insert(key.clone(), value.clone());
            state.broadcast(&key.0, &value, WatchEvent::Modified);
        }
        to_object(value)
    }

    async fn replace_status(
        &self,
        endpoint: &Endpoint,
        name: &str,
        params: &PostParams,
        data: Vec<u8>,
    ) -> Result<DynamicObject> {
        let mut state = self.state();
        state.record(Verb::ReplaceStatus)?;
        let key = key(endpoint, name);
        let mut value = state.existing(&key)?;
        let status = serde_json::from_slice::<Value>(&data)?
            .get("status")
            .cloned()
            .unwrap_or(Value::Null);
        value["status"] = status;
        let rv = state.next_version();
        metadata(&mut value).insert("resourceVersion".into(), Value::String(rv));
        if !params.dry_run {
            state.objects.insert(key.clone(), value.clone());
            state.broadcast(&key.0, &value, WatchEvent::Modified);
        }
        to_object(value)
    }

    async fn delete(&self, endpoint: &Endpoint, name: &str, params: &DeleteParams) -> Result<()> {
        let mut state = self.state();
        state.record(Verb::Delete)?;
        state.last_delete = Some(params.clone());
        let key = key(endpoint, name);
        let mut value = state.existing(&key)?;
        if !params.dry_run {
            state.objects.remove(&key);
            let rv = state.next_version();
            metadata(&mut value).insert("resourceVersion".into(), Value::String(rv));
            state.broadcast(&key.0, &value, WatchEvent::Deleted);
        }
        Ok(())
    }

    async fn get(&self, endpoint: &Endpoint, name: &str) -> Result<DynamicObject> {
        let mut state = self.state();
        state.record(Verb::Get)?;
        to_object(state.existing(&key(endpoint, name))?)
    }

    async fn list(&self, endpoint: &Endpoint, params: &ListParams) -> Result<Page> {
        let mut state = self.state();
        state.record(Verb::List)?;
        state.last_list = Some(params.clone());
        let resource = resource_key(&endpoint.resource);
        let matching: Vec<Value> = state
            .objects
            .iter()
            .filter(|((r, ns, _), _)| {
                *r == resource && endpoint.namespace.as_ref().map_or(true, |want| want == ns)
            })
            .map(|(_, v)| v)
            .filter(|v| {
                selected(
                    v,
                    params.label_selector.as_deref(),
                    params.field_selector.as_deref(),
                )
            })
            .cloned()
            .collect();

        let start = match params.continue_token.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::status(410, "Expired", "invalid continue token"))?,
            None => 0,
        };
        let end = match params.limit {
            Some(limit) => (start + limit as usize).min(matching.len()),
            None => matching.len(),
        };
        let items = matching[start.min(end)..end]
            .iter()
            .cloned()
            .map(to_object)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            continue_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn watch(
        &self,
        endpoint: &Endpoint,
        params: &WatchParams,
        _resource_version: &str,
    ) -> Result<EventStream> {
        let mut state = self.state();
        state.record(Verb::Watch)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            resource: resource_key(&endpoint.resource),
            namespace: endpoint.namespace.clone(),
            label_selector: params.label_selector.clone(),
            field_selector: params.field_selector.clone(),
            tx,
        };
        for obj in state.objects.values() {
            if watcher.wants(&watcher.resource, obj) {
                let _ = watcher.tx.send(Ok(WatchEvent::Added(to_object(obj.clone())?)));
            }
        }
        state.watchers.push(watcher);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn patch(
        &self,
        endpoint: &Endpoint,
        name: &str,
        params: &PatchParams,
        patch: &Patch<Value>,
    ) -> Result<DynamicObject> {
        let mut state = self.state();
        state.record(Verb::Patch)?;
        let key = key(endpoint, name);
        let current = state.existing(&key)?;
        let request = match patch {
            Patch::Strategic(v) => PatchRequest::new(PatchKind::Strategic, serde_json::to_vec(v)?),
            Patch::Merge(v) => PatchRequest::new(PatchKind::Merge, serde_json::to_vec(v)?),
            Patch::Json(ops) => PatchRequest::new(PatchKind::Json, serde_json::to_vec(ops)?),
            _ => {
                return Err(Error::status(
                    415,
                    "UnsupportedMediaType",
                    "the fake cluster does not support this patch type",
                ))
            }
        };
        let mut value = match request.apply_to(&current) {
            Ok(value) => value,
            Err(Error::StrategicMergeUnsupported { .. }) => {
                return Err(Error::status(
                    415,
                    "UnsupportedMediaType",
                    "strategic merge patch is not supported for custom resources",
                ))
            }
            Err(e) => return Err(Error::status(422, "Invalid", e.to_string())),
        };
        let rv = state.next_version();
        let meta = metadata(&mut value);
        meta.insert("name".into(), current["metadata"]["name"].clone());
        meta.insert("uid".into(), current["metadata"]["uid"].clone());
        meta.insert("resourceVersion".into(), Value::String(rv));
        if !params.dry_run {
            state.objects.insert(key.clone(), value.clone());
            state.broadcast(&key.0, &value, WatchEvent::Modified);
        }
        to_object(value)
    }
}

#[async_trait]
impl RestMapper for FakeCluster {
    async fn rest_mapping(&self, group_kind: &GroupKind, version: &str) -> Result<RestMapping> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        TYPES
            .iter()
            .find(|(g, v, k, r, _)| {
                *g == group_kind.group && *v == version && *k == group_kind.kind && !r.contains('/')
            })
            .map(|&(_, _, _, resource, namespaced)| RestMapping {
                resource: resource.to_string(),
                scope_name: if namespaced { SCOPE_NAMESPACE } else { SCOPE_ROOT }.to_string(),
            })
            .ok_or_else(|| Error::NoMatch {
                api_version: if group_kind.group.is_empty() {
                    version.to_string()
                } else {
                    format!("{}/{}", group_kind.group, version)
                },
                kind: group_kind.kind.clone(),
            })
    }

    async fn discover(&self) -> Result<Vec<ResourceDescriptor>> {
        Ok(TYPES
            .iter()
            .map(|&(group, version, kind, resource, namespaced)| ResourceDescriptor {
                group: group.to_string(),
                version: version.to_string(),
                kind: kind.to_string(),
                resource: resource.to_string(),
                namespaced,
            })
            .collect())
    }
}

fn selected(obj: &Value, labels: Option<&str>, fields: Option<&str>) -> bool {
    labels.map_or(true, |s| labels_match(s, obj.get("metadata").and_then(|m| m.get("labels"))))
        && fields.map_or(true, |s| fields_match(s, obj))
}

fn split_terms(selector: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let (mut depth, mut start) = (0usize, 0usize);
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(selector[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(selector[start..].trim());
    terms.into_iter().filter(|t| !t.is_empty()).collect()
}

fn parse_set(set: &str) -> Vec<&str> {
    set.trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .collect()
}

fn labels_match(selector: &str, labels: Option<&Value>) -> bool {
    let get = |k: &str| labels.and_then(|l| l.get(k.trim())).and_then(Value::as_str);
    split_terms(selector).into_iter().all(|term| {
        if let Some((k, set)) = term.split_once(" notin ") {
            return get(k).map_or(true, |v| !parse_set(set).contains(&v));
        }
        if let Some((k, set)) = term.split_once(" in ") {
            return get(k).map_or(false, |v| parse_set(set).contains(&v));
        }
        if let Some((k, v)) = term.split_once("!=") {
            return get(k) != Some(v.trim());
        }
        if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            return get(k) == Some(v.trim());
        }
        if let Some(k) = term.strip_prefix('!') {
            return get(k).is_none();
        }
        get(term).is_some()
    })
}

fn fields_match(selector: &str, obj: &Value) -> bool {
    let get = |path: &str| {
        path.trim()
            .split('.')
            .try_fold(obj, |v, segment| v.get(segment))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    };
    split_terms(selector).into_iter().all(|term| {
        if let Some((path, v)) = term.split_once("!=") {
            return get(path).as_deref() != Some(v.trim());
        }
        match term.split_once("==").or_else(|| term.split_once('=')) {
            Some((path, v)) => get(path).as_deref() == Some(v.trim()),
            None => false,
        }
    })
}

/// Maps an `ErrorClass` to the status a server would send for it.
pub fn status_for(class: ErrorClass) -> (u16, &'static str) {
    match class {
        ErrorClass::NotFound => (404, "NotFound"),
        ErrorClass::Conflict => (409, "Conflict"),
        ErrorClass::AlreadyExists => (409, "AlreadyExists"),
        ErrorClass::Invalid => (422, "Invalid"),
        ErrorClass::Forbidden => (403, "Forbidden"),
        _ => (500, "InternalError"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn label_selectors() {
        let labels = json!({"app": "web", "tier": "frontend"});
        assert!(labels_match("app=web", Some(&labels)));
        assert!(labels_match("app==web,tier", Some(&labels)));
        assert!(labels_match("app in (web, api),!canary", Some(&labels)));
        assert!(!labels_match("tier notin (frontend)", Some(&labels)));
        assert!(!labels_match("app!=web", Some(&labels)));
        assert!(!labels_match("app", None));
    }

    #[test]
    fn field_selectors() {
        let obj = json!({"metadata": {"name": "web", "namespace": "default"}, "spec": {"replicas": 2}});
        assert!(fields_match("metadata.name=web", &obj));
        assert!(fields_match("metadata.namespace!=kube-system,spec.replicas=2", &obj));
        assert!(!fields_match("metadata.name=api", &obj));
    }
}
