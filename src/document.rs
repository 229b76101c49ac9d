//! Canonical in-memory form of API objects and the input shapes accepted
//! at the library boundary.

use crate::errors::{DecodeError, Error, Result};
use kube::core::{DynamicObject, GroupVersionKind};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// One API object in its generic ("unstructured") form.
///
/// Keys keep their insertion order. A non-empty document always carries
/// `apiVersion` and `kind`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Wraps a mapping, checking the type fields when it is non-empty.
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        if !map.is_empty() {
            for field in ["apiVersion", "kind"] {
                match map.get(field) {
                    Some(Value::String(s)) if !s.is_empty() => {}
                    _ => return Err(DecodeError::MissingField(field).into()),
                }
            }
        }
        Ok(Document(map))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Document::default()),
            Value::Object(map) => Document::from_map(map),
            other => Err(DecodeError::NotAMapping(value_type(&other)).into()),
        }
    }

    /// Decodes a single YAML or JSON document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if is_blank(bytes) {
            return Ok(Document::default());
        }
        let value: Value = serde_yaml::from_slice(bytes)?;
        Document::from_value(value)
    }

    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        Document::from_value(serde_json::to_value(obj)?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn api_version(&self) -> Option<&str> {
        self.0.get("apiVersion").and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Value::as_str)
    }

    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata_str("name")
    }

    pub fn generate_name(&self) -> Option<&str> {
        self.metadata_str("generateName")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata_str("namespace")
    }

    /// Returns the name, failing for documents that cannot be addressed.
    pub fn require_name(&self) -> Result<&str> {
        self.name().ok_or(Error::MissingName)
    }

    /// Group/version/kind from the type fields.
    pub fn gvk(&self) -> Result<GroupVersionKind> {
        if self.is_empty() {
            return Err(Error::EmptyDocument);
        }
        let api_version = self
            .api_version()
            .ok_or(DecodeError::MissingField("apiVersion"))?;
        let kind = self.kind().ok_or(DecodeError::MissingField("kind"))?;
        let (group, version) = split_api_version(api_version);
        Ok(GroupVersionKind::gvk(group, version, kind))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// The document serialized as JSON, as it goes over the wire.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    pub fn to_object(&self) -> Result<DynamicObject> {
        Ok(serde_json::from_value(self.to_value())?)
    }
}

/// Splits `apps/v1` into `("apps", "v1")` and `v1` into `("", "v1")`.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Blank means nothing but whitespace, comment lines and `---` markers.
pub(crate) fn is_blank(bytes: &[u8]) -> bool {
    String::from_utf8_lossy(bytes).lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#') || line == "---"
    })
}

pub(crate) fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Every shape an object can be handed to the library in.
#[derive(Debug, Clone)]
pub enum InputPayload {
    /// Path to a YAML or JSON file holding one document.
    Path(PathBuf),
    /// YAML or JSON content.
    Bytes(Vec<u8>),
    /// Generic string-keyed attributes.
    Attributes(Map<String, Value>),
    /// An object already in kube's generic form.
    Wrapped(DynamicObject),
    /// A serialized `k8s_openapi` object.
    Typed(Value),
}

impl InputPayload {
    /// Accepts any typed API object. Type fields come from the type itself,
    /// since some serializers omit them for default values.
    pub fn typed<K>(obj: &K) -> Result<Self>
    where
        K: k8s_openapi::Resource + Serialize,
    {
        let mut value = serde_json::to_value(obj)?;
        match &mut value {
            Value::Object(map) => {
                map.entry("apiVersion")
                    .or_insert_with(|| Value::String(K::API_VERSION.to_string()));
                map.entry("kind")
                    .or_insert_with(|| Value::String(K::KIND.to_string()));
            }
            other => {
                return Err(Error::Type {
                    found: value_type(other),
                })
            }
        }
        Ok(InputPayload::Typed(value))
    }

    /// Accepts any serializable value that serializes to a mapping.
    pub fn structured<T: Serialize>(obj: &T) -> Result<Self> {
        InputPayload::try_from(serde_json::to_value(obj)?)
    }

    /// Raw bytes of a path or byte payload.
    pub fn read_raw(&self) -> Result<Option<Vec<u8>>> {
        match self {
            InputPayload::Path(path) => read_file(path).map(Some),
            InputPayload::Bytes(bytes) => Ok(Some(bytes.clone())),
            _ => Ok(None),
        }
    }

    /// Converts the payload into its canonical document.
    pub fn normalize(&self) -> Result<Document> {
        match self {
            InputPayload::Path(path) => Document::from_slice(&read_file(path)?),
            InputPayload::Bytes(bytes) => Document::from_slice(bytes),
            InputPayload::Attributes(map) => Document::from_map(map.clone()),
            InputPayload::Wrapped(obj) => Document::from_object(obj),
            InputPayload::Typed(value) => Document::from_value(value.clone()),
        }
    }
}

pub(crate) fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl From<PathBuf> for InputPayload {
    fn from(path: PathBuf) -> Self {
        InputPayload::Path(path)
    }
}

impl From<&Path> for InputPayload {
    fn from(path: &Path) -> Self {
        InputPayload::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for InputPayload {
    fn from(bytes: Vec<u8>) -> Self {
        InputPayload::Bytes(bytes)
    }
}

impl From<&[u8]> for InputPayload {
    fn from(bytes: &[u8]) -> Self {
        InputPayload::Bytes(bytes.to_vec())
    }
}

impl From<Map<String, Value>> for InputPayload {
    fn from(map: Map<String, Value>) -> Self {
        InputPayload::Attributes(map)
    }
}

impl From<DynamicObject> for InputPayload {
    fn from(obj: DynamicObject) -> Self {
        InputPayload::Wrapped(obj)
    }
}

impl From<Document> for InputPayload {
    fn from(doc: Document) -> Self {
        InputPayload::Attributes(doc.0)
    }
}

impl TryFrom<Value> for InputPayload {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(InputPayload::Attributes(map)),
            other => Err(Error::Type {
                found: value_type(&other),
            }),
        }
    }
}

/// Splits a multi-document manifest into its documents.
///
/// The stream is cut at every `---` line. Sections holding nothing but
/// whitespace and `#` comment lines are skipped; everything else is returned
/// untouched for decoding, so `#` lines inside block scalars survive.
pub fn split_manifest(content: &[u8]) -> Result<Vec<Vec<u8>>> {
    let text = std::str::from_utf8(content).map_err(|e| {
        DecodeError::Yaml(serde::de::Error::custom(format!("manifest is not utf-8: {}", e)))
    })?;
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" {
            push_section(&mut documents, std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    push_section(&mut documents, current);
    Ok(documents)
}

fn push_section(documents: &mut Vec<Vec<u8>>, section: String) {
    if !is_blank(section.as_bytes()) {
        documents.push(section.into_bytes());
    }
}

/// Decodes every document of a multi-document manifest.
pub fn decode_manifest(content: &[u8]) -> Result<Vec<Document>> {
    split_manifest(content)?
        .iter()
        .map(|section| Document::from_slice(section))
        .collect()
}
