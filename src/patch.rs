//! Patch computation and dispatch.
//!
//! A patch comes either as a complete patch document (file or bytes, YAML or
//! JSON) or as a full object of the same kind, in which case the patch is the
//! diff between the original and that object.

pub mod strategic;

use crate::{
    document::{is_blank, Document, InputPayload},
    errors::{Error, Result},
};
use kube::{api::Patch, core::GroupVersionKind};
use serde_json::{Map, Value};
use strategic::Schema;

/// Patch semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
pub enum PatchKind {
    /// Schema-aware merge of built-in types
    #[default]
    #[strum(serialize = "strategic")]
    Strategic,
    /// RFC 7386
    #[strum(serialize = "merge")]
    Merge,
    /// RFC 6902
    #[strum(serialize = "json")]
    Json,
}

impl PatchKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchKind::Strategic => "application/strategic-merge-patch+json",
            PatchKind::Merge => "application/merge-patch+json",
            PatchKind::Json => "application/json-patch+json",
        }
    }
}

/// A patch ready to be sent. The payload is always JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRequest {
    pub kind: PatchKind,
    pub payload: Vec<u8>,
}

impl PatchRequest {
    pub fn new(kind: PatchKind, payload: Vec<u8>) -> Self {
        PatchRequest { kind, payload }
    }

    /// Takes a complete patch document in YAML or JSON. Documents that are
    /// blank, comments only or `null` give an empty payload.
    pub fn from_raw(kind: PatchKind, raw: &[u8]) -> Result<Self> {
        if is_blank(raw) {
            return Ok(PatchRequest::new(kind, Vec::new()));
        }
        match serde_yaml::from_slice::<Value>(raw)? {
            Value::Null => Ok(PatchRequest::new(kind, Vec::new())),
            value => Ok(PatchRequest::new(kind, serde_json::to_vec(&value)?)),
        }
    }

    /// Whether sending this patch would change nothing: the payload is empty,
    /// `null`, `{}`, or an empty JSON Patch operation list.
    pub fn is_noop(&self) -> bool {
        if self.payload.iter().all(u8::is_ascii_whitespace) {
            return true;
        }
        match serde_json::from_slice::<Value>(&self.payload) {
            Ok(Value::Null) => true,
            Ok(Value::Object(map)) => map.is_empty(),
            Ok(Value::Array(ops)) => self.kind == PatchKind::Json && ops.is_empty(),
            _ => false,
        }
    }

    fn value(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    fn operations(&self) -> Result<json_patch::Patch> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn to_kube_patch(&self) -> Result<Patch<Value>> {
        Ok(match self.kind {
            PatchKind::Strategic => Patch::Strategic(self.value()?),
            PatchKind::Merge => Patch::Merge(self.value()?),
            PatchKind::Json => Patch::Json(self.operations()?),
        })
    }

    /// Applies the patch locally, the way the API server would.
    pub fn apply_to(&self, target: &Value) -> Result<Value> {
        if self.is_noop() {
            return Ok(target.clone());
        }
        match self.kind {
            PatchKind::Strategic => {
                let gvk = Document::from_value(target.clone())?.gvk()?;
                strategic::apply(&Schema::for_gvk(&gvk)?, target, &self.value()?)
            }
            PatchKind::Merge => {
                let mut patched = target.clone();
                json_patch::merge(&mut patched, &self.value()?);
                Ok(patched)
            }
            PatchKind::Json => {
                let mut patched = target.clone();
                json_patch::patch(&mut patched, &self.operations()?)?;
                Ok(patched)
            }
        }
    }
}

/// Builds the patch that turns `original` into what `source` describes.
///
/// Raw sources are taken as the patch itself. Object sources must be of the
/// same group and kind as `original` and are diffed against it. An empty
/// object source yields an empty patch.
#[tracing::instrument(skip_all, fields(kind = ?kind))]
pub fn build(
    original: &Document,
    source: &InputPayload,
    kind: Option<PatchKind>,
) -> Result<PatchRequest> {
    let kind = kind.unwrap_or_default();
    if let Some(raw) = source.read_raw()? {
        return PatchRequest::from_raw(kind, &raw);
    }
    let modified = source.normalize()?;
    if modified.is_empty() {
        return Ok(PatchRequest::new(kind, Vec::new()));
    }
    let expected = original.gvk()?;
    let found = modified.gvk()?;
    if expected.group != found.group || expected.kind != found.kind {
        return Err(Error::TypeMismatch {
            expected: describe(&expected),
            found: describe(&found),
        });
    }
    diff(original, &modified, kind)
}

fn describe(gvk: &GroupVersionKind) -> String {
    format!("{} {}", gvk.api_version(), gvk.kind)
}

/// Two-way diff between two documents in the requested patch format.
pub fn diff(original: &Document, modified: &Document, kind: PatchKind) -> Result<PatchRequest> {
    let (original_value, modified_value) = (original.to_value(), modified.to_value());
    let payload = match kind {
        PatchKind::Strategic => {
            let schema = Schema::for_gvk(&original.gvk()?)?;
            serde_json::to_vec(&strategic::diff(&schema, &original_value, &modified_value)?)?
        }
        PatchKind::Merge => serde_json::to_vec(&merge_diff(&original_value, &modified_value))?,
        PatchKind::Json => serde_json::to_vec(&json_patch::diff(&original_value, &modified_value))?,
    };
    Ok(PatchRequest::new(kind, payload))
}

/// RFC 7386 merge patch turning `original` into `modified`.
pub fn merge_diff(original: &Value, modified: &Value) -> Value {
    let (original, modified) = match (original, modified) {
        (Value::Object(o), Value::Object(m)) => (o, m),
        _ => return modified.clone(),
    };
    let mut patch = Map::new();
    for key in original.keys() {
        if !modified.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, new) in modified {
        match original.get(key) {
            Some(old) if old == new => {}
            Some(old) => {
                patch.insert(key.clone(), merge_diff(old, new));
            }
            None => {
                patch.insert(key.clone(), new.clone());
            }
        }
    }
    Value::Object(patch)
}
