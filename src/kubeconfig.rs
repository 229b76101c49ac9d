//! Connection configuration.

use crate::errors::Result;
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use std::path::Path;

/// Loads the cluster configuration.
///
/// With an explicit `path` the kubeconfig at that path is used. Otherwise
/// the configuration is inferred: `KUBECONFIG`, then `~/.kube/config`, then
/// the in-cluster service account. `context` selects a kubeconfig context
/// other than the current one.
pub async fn load_config(path: Option<&Path>, context: Option<&str>) -> Result<Config> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    match (path, context) {
        (Some(path), _) => {
            tracing::debug!(path = %path.display(), "loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path)?;
            Ok(Config::from_custom_kubeconfig(kubeconfig, &options).await?)
        }
        (None, Some(_)) => Ok(Config::from_kubeconfig(&options).await?),
        (None, None) => Ok(Config::infer().await?),
    }
}
