//! Strategic merge patches for built-in types.
//!
//! Lists are merged according to per-field merge keys instead of being
//! replaced wholesale. Only the built-in API groups have a schema; custom
//! resources must be patched with a JSON merge patch.

use crate::{
    document::value_type,
    errors::{DecodeError, Error, Result},
};
use kube::core::GroupVersionKind;
use serde_json::{Map, Value};

const DIRECTIVE: &str = "$patch";
const RETAIN_KEYS: &str = "$retainKeys";
const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";
const SET_ELEMENT_ORDER: &str = "$setElementOrder/";

const BUILTIN_GROUPS: &[&str] = &[
    "",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
    "apps",
    "autoscaling",
    "batch",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "flowcontrol.apiserver.k8s.io",
    "networking.k8s.io",
    "node.k8s.io",
    "policy",
    "rbac.authorization.k8s.io",
    "scheduling.k8s.io",
    "storage.k8s.io",
];

/// How a list field is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStrategy {
    /// Elements are objects identified by the given field.
    MergeByKey(&'static str),
    /// Elements are scalars merged as a set.
    MergeSet,
    /// The patch list replaces the target list.
    Replace,
}

/// Merge metadata of the built-in types.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    _priv: (),
}

impl Schema {
    pub fn for_gvk(gvk: &GroupVersionKind) -> Result<Schema> {
        if BUILTIN_GROUPS.contains(&gvk.group.as_str()) {
            Ok(Schema { _priv: () })
        } else {
            Err(Error::StrategicMergeUnsupported {
                api_version: gvk.api_version(),
                kind: gvk.kind.clone(),
            })
        }
    }

    /// Strategy of the list reached through `path`; list indices are not
    /// part of the path.
    pub fn list_strategy(&self, path: &[String]) -> ListStrategy {
        let field = path.last().map(String::as_str).unwrap_or_default();
        let parent = match path.len() {
            0 | 1 => "",
            n => path[n - 2].as_str(),
        };
        match (parent, field) {
            ("metadata", "finalizers") => ListStrategy::MergeSet,
            ("metadata", "ownerReferences") => ListStrategy::MergeByKey("uid"),
            ("containers" | "initContainers" | "ephemeralContainers", "ports") => {
                ListStrategy::MergeByKey("containerPort")
            }
            ("spec", "ports") => ListStrategy::MergeByKey("port"),
            (
                _,
                "containers" | "initContainers" | "ephemeralContainers" | "env" | "volumes"
                | "imagePullSecrets",
            ) => ListStrategy::MergeByKey("name"),
            (_, "volumeMounts") => ListStrategy::MergeByKey("mountPath"),
            (_, "volumeDevices") => ListStrategy::MergeByKey("devicePath"),
            (_, "conditions") => ListStrategy::MergeByKey("type"),
            (_, "hostAliases") => ListStrategy::MergeByKey("ip"),
            _ => ListStrategy::Replace,
        }
    }
}

fn as_object<'a>(value: &'a Value, what: &'static str) -> Result<&'a Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => {
            tracing::debug!(what, "strategic merge operand is not an object");
            Err(DecodeError::NotAMapping(value_type(other)).into())
        }
    }
}

fn directive(value: &Value) -> Option<&str> {
    value.get(DIRECTIVE).and_then(Value::as_str)
}

/// Applies a strategic merge patch to `target`.
pub fn apply(schema: &Schema, target: &Value, patch: &Value) -> Result<Value> {
    let patch = as_object(patch, "patch")?;
    let mut out = as_object(target, "target")?.clone();
    merge_object(schema, &mut out, patch, &mut Vec::new());
    Ok(Value::Object(out))
}

fn merge_object(
    schema: &Schema,
    target: &mut Map<String, Value>,
    patch: &Map<String, Value>,
    path: &mut Vec<String>,
) {
    if patch.get(DIRECTIVE).and_then(Value::as_str) == Some("replace") {
        *target = strip_map(patch);
        return;
    }
    for (key, patch_value) in patch {
        if key == DIRECTIVE || key == RETAIN_KEYS || key.starts_with(SET_ELEMENT_ORDER) {
            continue;
        }
        if let Some(field) = key.strip_prefix(DELETE_FROM_PRIMITIVE_LIST) {
            if let (Some(Value::Array(list)), Some(remove)) =
                (target.get_mut(field), patch_value.as_array())
            {
                list.retain(|item| !remove.contains(item));
            }
            continue;
        }
        match patch_value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(patch_map) => match directive(patch_value) {
                Some("delete") => {
                    target.remove(key);
                }
                Some("replace") => {
                    target.insert(key.clone(), Value::Object(strip_map(patch_map)));
                }
                _ => match target.get_mut(key) {
                    Some(Value::Object(target_map)) => {
                        path.push(key.clone());
                        merge_object(schema, target_map, patch_map, path);
                        path.pop();
                    }
                    _ => {
                        target.insert(key.clone(), Value::Object(strip_map(patch_map)));
                    }
                },
            },
            Value::Array(patch_list) => {
                path.push(key.clone());
                let strategy = schema.list_strategy(path);
                match (strategy, target.get_mut(key)) {
                    (ListStrategy::MergeByKey(merge_key), Some(Value::Array(target_list))) => {
                        merge_keyed_list(schema, target_list, patch_list, merge_key, path);
                    }
                    (ListStrategy::MergeSet, Some(Value::Array(target_list))) => {
                        for item in patch_list {
                            if !target_list.contains(item) {
                                target_list.push(item.clone());
                            }
                        }
                    }
                    _ => {
                        target.insert(key.clone(), Value::Array(strip_list(patch_list)));
                    }
                }
                path.pop();
            }
            scalar => {
                target.insert(key.clone(), scalar.clone());
            }
        }
    }
    for (key, order) in patch {
        let (field, order) = match (key.strip_prefix(SET_ELEMENT_ORDER), order.as_array()) {
            (Some(field), Some(order)) => (field, order),
            _ => continue,
        };
        if let Some(Value::Array(list)) = target.get_mut(field) {
            path.push(field.to_string());
            reorder(list, order, schema.list_strategy(path));
            path.pop();
        }
    }
}

fn merge_keyed_list(
    schema: &Schema,
    target: &mut Vec<Value>,
    patch: &[Value],
    merge_key: &str,
    path: &mut Vec<String>,
) {
    if patch.iter().any(|item| directive(item) == Some("replace")) {
        *target = strip_list(patch);
        return;
    }
    for item in patch {
        let item_map = match item {
            Value::Object(map) => map,
            other => {
                target.push(other.clone());
                continue;
            }
        };
        let position = item_map
            .get(merge_key)
            .and_then(|key| target.iter().position(|t| t.get(merge_key) == Some(key)));
        match (directive(item), position) {
            (Some("delete"), Some(idx)) => {
                target.remove(idx);
            }
            (Some("delete"), None) => {}
            (_, Some(idx)) => {
                if let Value::Object(target_map) = &mut target[idx] {
                    merge_object(schema, target_map, item_map, path);
                }
            }
            (_, None) => target.push(Value::Object(strip_map(item_map))),
        }
    }
}

fn reorder(list: &mut [Value], order: &[Value], strategy: ListStrategy) {
    let rank = |item: &Value| {
        order
            .iter()
            .position(|o| match strategy {
                ListStrategy::MergeByKey(key) => {
                    o.get(key).is_some() && o.get(key) == item.get(key)
                }
                _ => o == item,
            })
            .unwrap_or(usize::MAX)
    };
    list.sort_by_key(rank);
}

/// Drops directives and nulls from a subtree that is inserted verbatim.
fn strip_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(k, v)| !k.starts_with('$') && !v.is_null())
        .map(|(k, v)| (k.clone(), strip(v)))
        .collect()
}

fn strip_list(list: &[Value]) -> Vec<Value> {
    list.iter()
        .filter(|item| directive(item).is_none())
        .map(strip)
        .collect()
}

fn strip(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(strip_map(map)),
        Value::Array(list) => Value::Array(strip_list(list)),
        other => other.clone(),
    }
}

/// Computes the two-way strategic merge patch turning `original` into
/// `modified`.
pub fn diff(schema: &Schema, original: &Value, modified: &Value) -> Result<Value> {
    let original = as_object(original, "original")?;
    let modified = as_object(modified, "modified")?;
    Ok(Value::Object(diff_object(
        schema,
        original,
        modified,
        &mut Vec::new(),
    )))
}

fn diff_object(
    schema: &Schema,
    original: &Map<String, Value>,
    modified: &Map<String, Value>,
    path: &mut Vec<String>,
) -> Map<String, Value> {
    let mut patch = Map::new();
    for key in original.keys() {
        if !modified.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, new) in modified {
        let old = match original.get(key) {
            Some(old) if old == new => continue,
            Some(old) => old,
            None => {
                patch.insert(key.clone(), new.clone());
                continue;
            }
        };
        path.push(key.clone());
        match (old, new) {
            (Value::Object(old_map), Value::Object(new_map)) => {
                let nested = diff_object(schema, old_map, new_map, path);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            (Value::Array(old_list), Value::Array(new_list)) => {
                let strategy = schema.list_strategy(path);
                diff_list(schema, &mut patch, key, old_list, new_list, strategy, path);
            }
            _ => {
                patch.insert(key.clone(), new.clone());
            }
        }
        path.pop();
    }
    patch
}

fn keyed<'a>(list: &'a [Value], merge_key: &str) -> Option<Vec<(&'a Value, &'a Map<String, Value>)>> {
    let mut out = Vec::with_capacity(list.len());
    for item in list {
        let map = item.as_object()?;
        let key = map.get(merge_key)?;
        if out.iter().any(|(k, _)| *k == key) {
            return None;
        }
        out.push((key, map));
    }
    Some(out)
}

fn diff_list(
    schema: &Schema,
    patch: &mut Map<String, Value>,
    field: &str,
    old: &[Value],
    new: &[Value],
    strategy: ListStrategy,
    path: &mut Vec<String>,
) {
    match strategy {
        ListStrategy::MergeByKey(merge_key) => {
            let (old_items, new_items) = match (keyed(old, merge_key), keyed(new, merge_key)) {
                (Some(o), Some(n)) => (o, n),
                _ => {
                    patch.insert(field.to_string(), Value::Array(new.to_vec()));
                    return;
                }
            };
            let mut changes = Vec::new();
            for (key, new_map) in &new_items {
                match old_items.iter().find(|(k, _)| k == key) {
                    None => changes.push(Value::Object((*new_map).clone())),
                    Some((_, old_map)) => {
                        let mut nested = diff_object(schema, old_map, new_map, path);
                        if !nested.is_empty() {
                            nested.insert(merge_key.to_string(), (*key).clone());
                            changes.push(Value::Object(nested));
                        }
                    }
                }
            }
            for (key, _) in &old_items {
                if !new_items.iter().any(|(k, _)| k == key) {
                    let mut deletion = Map::new();
                    deletion.insert(merge_key.to_string(), (*key).clone());
                    deletion.insert(DIRECTIVE.to_string(), Value::String("delete".to_string()));
                    changes.push(Value::Object(deletion));
                }
            }
            if !changes.is_empty() {
                patch.insert(field.to_string(), Value::Array(changes));
            }
            let order = new_items
                .iter()
                .map(|(key, _)| {
                    let mut entry = Map::new();
                    entry.insert(merge_key.to_string(), (*key).clone());
                    Value::Object(entry)
                })
                .collect();
            patch.insert(format!("{}{}", SET_ELEMENT_ORDER, field), Value::Array(order));
        }
        ListStrategy::MergeSet => {
            let added: Vec<Value> = new.iter().filter(|v| !old.contains(v)).cloned().collect();
            let removed: Vec<Value> = old.iter().filter(|v| !new.contains(v)).cloned().collect();
            if !added.is_empty() {
                patch.insert(field.to_string(), Value::Array(added));
            }
            if !removed.is_empty() {
                patch.insert(
                    format!("{}{}", DELETE_FROM_PRIMITIVE_LIST, field),
                    Value::Array(removed),
                );
            }
            patch.insert(
                format!("{}{}", SET_ELEMENT_ORDER, field),
                Value::Array(new.to_vec()),
            );
        }
        ListStrategy::Replace => {
            patch.insert(field.to_string(), Value::Array(new.to_vec()));
        }
    }
}
