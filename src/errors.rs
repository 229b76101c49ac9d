//! Error utilities

use std::path::PathBuf;
use thiserror::Error;

/// Shapes `InputPayload` can be built from. Reported verbatim by [`Error::Type`].
pub const ACCEPTED_SHAPES: &str =
    "file path, raw bytes, attribute map, structured object, wrapped object or typed object";

/// Failure to turn input bytes into a document.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a mapping at the document root, found {0}")]
    NotAMapping(&'static str),

    #[error("document is missing `{0}`")]
    MissingField(&'static str),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to decode document: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document is empty")]
    EmptyDocument,

    #[error("unsupported input of type {found}, expected one of: {ACCEPTED_SHAPES}")]
    Type { found: &'static str },

    #[error("patch source is {found}, expected an object of kind {expected}")]
    TypeMismatch { expected: String, found: String },

    #[error("no matches for kind {kind:?} in version {api_version:?}")]
    NoMatch { api_version: String, kind: String },

    #[error("resource {resource:?} is not namespaced")]
    NotNamespaced { resource: String },

    #[error("document has no metadata.name")]
    MissingName,

    #[error("handler has no resource kind configured")]
    NoKind,

    #[error("failed to apply patch: {0}")]
    Patch(#[from] json_patch::PatchError),

    #[error("strategic merge patch is not supported for {kind} ({api_version})")]
    StrategicMergeUnsupported { api_version: String, kind: String },

    #[error("{reason} ({code}): {message}")]
    Status {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("kube error: {0}")]
    Kube(#[source] kube::Error),

    #[error("api discovery failed: {0}")]
    Discovery(#[source] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("failed to infer cluster config: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => Error::Status {
                code: resp.code,
                reason: resp.reason,
                message: resp.message,
            },
            other => Error::Kube(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(DecodeError::Json(err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Decode(DecodeError::Yaml(err))
    }
}

impl Error {
    /// Builds a status error the way the API server reports it.
    pub fn status(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Error::Status {
            code,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    /// Classifies the error. Anything that is not a status error is `Unknown`.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Status { reason, .. } => classify(reason),
            _ => ErrorClass::Unknown,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.class() == ErrorClass::AlreadyExists
    }
}

/// Describes error reason
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    AlreadyExists,
    Invalid,
    Forbidden,
    /// Catch-all variant. Since this enum is non-exhaustive,
    /// it should be handled with `_` pattern
    Unknown,
}

/// Tries to classify k8s error
pub fn classify(error_reason: &str) -> ErrorClass {
    match error_reason {
        "NotFound" => ErrorClass::NotFound,
        "Conflict" => ErrorClass::Conflict,
        "AlreadyExists" => ErrorClass::AlreadyExists,
        "Invalid" => ErrorClass::Invalid,
        "Forbidden" => ErrorClass::Forbidden,
        _ => ErrorClass::Unknown,
    }
}
