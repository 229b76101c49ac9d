//! Dynamic access to arbitrary Kubernetes resource kinds.
//!
//! [`Handler`] accepts objects in any [`InputPayload`] shape, resolves their
//! kind through cluster discovery and talks to the API server through a
//! [`transport::Transport`].

pub mod discovery;
pub mod document;
pub mod errors;
pub mod handler;
pub mod kubeconfig;
pub mod patch;
pub mod registry;
pub mod resolver;
pub mod transport;
pub mod watch;

#[cfg(test)]
mod fake;

pub use document::{Document, InputPayload};
pub use errors::{Error, ErrorClass, Result};
pub use handler::{BulkOptions, Handler, ListSelector, Options};
pub use patch::{PatchKind, PatchRequest};
pub use watch::{callbacks, Backoff, RetryPolicy, WatchHandler, WatchTarget};
