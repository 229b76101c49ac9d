//! Multi-document manifests.

use super::Handler;
use crate::{
    document::{decode_manifest, Document, InputPayload},
    errors::{Error, ErrorClass, Result},
    resolver::Resolver,
};
use kube::core::DynamicObject;

/// How a bulk call treats per-document failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Status classes that are logged and skipped instead of aborting
    pub ignore: Vec<ErrorClass>,
}

impl BulkOptions {
    pub fn ignoring(classes: impl IntoIterator<Item = ErrorClass>) -> Self {
        BulkOptions {
            ignore: classes.into_iter().collect(),
        }
    }

    fn ignores(&self, err: &Error) -> bool {
        matches!(err, Error::Status { .. }) && self.ignore.contains(&err.class())
    }
}

fn documents(manifest: &InputPayload) -> Result<Vec<Document>> {
    match manifest.read_raw()? {
        Some(raw) => decode_manifest(&raw),
        None => Ok(vec![manifest.normalize()?]),
    }
}

fn describe(doc: &Document) -> String {
    format!(
        "{}/{}",
        doc.kind().unwrap_or_default(),
        doc.name().unwrap_or_default()
    )
}

impl Handler {
    /// Applies every document of a `---` separated manifest, in order.
    /// Returns the objects that were applied.
    #[tracing::instrument(skip_all)]
    pub async fn apply_manifest(
        &self,
        manifest: impl Into<InputPayload>,
        options: &BulkOptions,
    ) -> Result<Vec<DynamicObject>> {
        let docs = documents(&manifest.into())?;
        let mut resolver = Resolver::new(&*self.mapper);
        let mut applied = Vec::with_capacity(docs.len());
        for doc in &docs {
            match self.apply_document(&mut resolver, doc).await {
                Ok(obj) => applied.push(obj),
                Err(e) if options.ignores(&e) => {
                    tracing::warn!(object = %describe(doc), error = %e, "skipping document");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(applied)
    }

    /// Deletes every document of a manifest, in order. Returns how many
    /// objects were deleted.
    #[tracing::instrument(skip_all)]
    pub async fn delete_manifest(
        &self,
        manifest: impl Into<InputPayload>,
        options: &BulkOptions,
    ) -> Result<usize> {
        let docs = documents(&manifest.into())?;
        let mut resolver = Resolver::new(&*self.mapper);
        let mut deleted = 0;
        for doc in &docs {
            match self.delete_document(&mut resolver, doc).await {
                Ok(()) => deleted += 1,
                Err(e) if options.ignores(&e) => {
                    tracing::warn!(object = %describe(doc), error = %e, "skipping document");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}
