//! Kind-agnostic handler: create, update, apply, delete, get, list, patch and
//! watch arbitrary objects.

mod bulk;

pub use bulk::BulkOptions;

use crate::{
    discovery::{DiscoveryMapper, RestMapper},
    document::{split_api_version, Document, InputPayload},
    errors::{Error, Result},
    kubeconfig,
    patch::{self, PatchKind},
    registry::ResourceRegistry,
    resolver::{Coordinates, Resolver},
    transport::{Endpoint, KubeTransport, Transport},
    watch::{RetryPolicy, WatchHandler, WatchLoop, WatchTarget},
};
use kube::{
    api::{DeleteParams, ListParams, PatchParams, PostParams, PropagationPolicy},
    core::{DynamicObject, GroupVersionKind},
    Client,
};
use std::{path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_FIELD_MANAGER: &str = "kube-dynamic";

/// Settings shared by every call of a [`Handler`].
#[derive(Debug, Clone)]
pub struct Options {
    pub namespace: String,
    /// Kind used by the name- and selector-based calls
    pub kind: Option<GroupVersionKind>,
    /// Server-side timeout for list and watch calls, in seconds
    pub timeout: Option<u32>,
    /// Page size for list calls
    pub limit: Option<u32>,
    pub dry_run: bool,
    /// Delete with a zero grace period
    pub force_delete: bool,
    /// Overrides the kind's default propagation policy
    pub propagation_policy: Option<PropagationPolicy>,
    pub field_manager: String,
    pub retry_policy: RetryPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            namespace: DEFAULT_NAMESPACE.to_string(),
            kind: None,
            timeout: None,
            limit: None,
            dry_run: false,
            force_delete: false,
            propagation_policy: None,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Which objects a list call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListSelector {
    /// Everything in the handler's namespace
    All,
    Labels(String),
    Fields(String),
    /// Everything in the given namespace; namespaced kinds only
    Namespace(String),
}

/// Entry point for dynamic operations.
///
/// Scoped variants (`with_*`) are cheap copies; they share the transport and
/// the discovery cache with the handler they were derived from.
#[derive(Clone)]
pub struct Handler {
    transport: Arc<dyn Transport>,
    mapper: Arc<dyn RestMapper>,
    options: Options,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Handler {
    pub fn new(transport: Arc<dyn Transport>, mapper: Arc<dyn RestMapper>) -> Self {
        Handler {
            transport,
            mapper,
            options: Options::default(),
        }
    }

    /// Talks to the cluster behind `client`, in the client's default
    /// namespace.
    pub fn from_client(client: Client) -> Self {
        let namespace = client.default_namespace().to_string();
        Handler::new(
            Arc::new(KubeTransport::new(client.clone())),
            Arc::new(DiscoveryMapper::new(client)),
        )
        .with_namespace(&namespace)
    }

    /// Connects using the kubeconfig at `path`, or the inferred
    /// configuration when `path` is `None`.
    pub async fn connect(path: Option<&Path>) -> Result<Self> {
        let config = kubeconfig::load_config(path, None).await?;
        Ok(Handler::from_client(Client::try_from(config)?))
    }

    pub async fn try_default() -> Result<Self> {
        Handler::connect(None).await
    }

    /// Like [`Handler::try_default`], but exits the process on failure.
    pub async fn try_default_or_die() -> Self {
        match Handler::try_default().await {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(error = %e, "failed to connect to the cluster");
                std::process::exit(1)
            }
        }
    }

    /// Like [`Handler::connect`] with an explicit kubeconfig, but exits the
    /// process on failure.
    pub async fn from_kubeconfig_or_die(path: &Path) -> Self {
        match Handler::connect(Some(path)).await {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to load kubeconfig");
                std::process::exit(1)
            }
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn namespace(&self) -> &str {
        &self.options.namespace
    }

    fn scoped(&self, change: impl FnOnce(&mut Options)) -> Self {
        let mut handler = self.clone();
        change(&mut handler.options);
        handler
    }

    pub fn with_namespace(&self, namespace: &str) -> Self {
        self.scoped(|o| o.namespace = namespace.to_string())
    }

    pub fn with_kind(&self, kind: GroupVersionKind) -> Self {
        self.scoped(|o| o.kind = Some(kind))
    }

    /// `api_version` is `group/version`, or just `version` for the core group.
    pub fn with_api_version_kind(&self, api_version: &str, kind: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        self.with_kind(GroupVersionKind::gvk(group, version, kind))
    }

    /// Scopes to a kind by any of its registry names (`Deployment`,
    /// `deployments`, `deployments.apps`).
    pub fn for_resource(&self, registry: &ResourceRegistry, name: &str) -> Result<Self> {
        Ok(self.with_kind(registry.require(name)?.gvk()))
    }

    pub fn with_timeout(&self, seconds: u32) -> Self {
        self.scoped(|o| o.timeout = Some(seconds))
    }

    pub fn with_limit(&self, limit: u32) -> Self {
        self.scoped(|o| o.limit = Some(limit))
    }

    pub fn with_dry_run(&self, dry_run: bool) -> Self {
        self.scoped(|o| o.dry_run = dry_run)
    }

    pub fn with_force_delete(&self, force: bool) -> Self {
        self.scoped(|o| o.force_delete = force)
    }

    pub fn with_propagation_policy(&self, policy: PropagationPolicy) -> Self {
        self.scoped(|o| o.propagation_policy = Some(policy))
    }

    pub fn with_field_manager(&self, manager: &str) -> Self {
        self.scoped(|o| o.field_manager = manager.to_string())
    }

    pub fn with_retry_policy(&self, policy: RetryPolicy) -> Self {
        self.scoped(|o| o.retry_policy = policy)
    }

    pub fn set_timeout(&mut self, seconds: Option<u32>) {
        self.options.timeout = seconds;
    }

    pub fn set_limit(&mut self, limit: Option<u32>) {
        self.options.limit = limit;
    }

    pub fn set_force_delete(&mut self, force: bool) {
        self.options.force_delete = force;
    }

    /// Registry of every kind the cluster serves.
    pub async fn registry(&self) -> Result<ResourceRegistry> {
        ResourceRegistry::discover(&*self.mapper).await
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&*self.mapper)
    }

    fn endpoint(&self, coords: &Coordinates, namespace: Option<&str>) -> Endpoint {
        Endpoint {
            resource: coords.api_resource(),
            namespace: coords
                .namespaced
                .then(|| namespace.unwrap_or(&self.options.namespace).to_string()),
        }
    }

    async fn configured_kind(&self) -> Result<Coordinates> {
        let kind = self.options.kind.as_ref().ok_or(Error::NoKind)?;
        self.resolver().resolve_gvk(kind).await
    }

    fn post_params(&self) -> PostParams {
        let mut params = PostParams::default();
        params.dry_run = self.options.dry_run;
        params.field_manager = Some(self.options.field_manager.clone());
        params
    }

    fn delete_params(&self, coords: &Coordinates) -> DeleteParams {
        let mut params = DeleteParams::default();
        params.dry_run = self.options.dry_run;
        params.propagation_policy = self
            .options
            .propagation_policy
            .clone()
            .or_else(|| coords.default_propagation());
        if self.options.force_delete {
            params.grace_period_seconds = Some(0);
        }
        params
    }

    fn patch_params(&self) -> PatchParams {
        let mut params = PatchParams::default();
        params.dry_run = self.options.dry_run;
        params.field_manager = Some(self.options.field_manager.clone());
        params
    }

    async fn create_document(
        &self,
        resolver: &mut Resolver<'_>,
        doc: &Document,
    ) -> Result<DynamicObject> {
        let coords = resolver.resolve(doc).await?;
        if doc.name().is_none() && doc.generate_name().is_none() {
            return Err(Error::MissingName);
        }
        let endpoint = self.endpoint(&coords, doc.namespace());
        self.transport
            .create(&endpoint, &self.post_params(), &doc.to_object()?)
            .await
    }

    async fn update_document(
        &self,
        resolver: &mut Resolver<'_>,
        doc: &Document,
    ) -> Result<DynamicObject> {
        let coords = resolver.resolve(doc).await?;
        let name = doc.require_name()?;
        let endpoint = self.endpoint(&coords, doc.namespace());
        self.transport
            .replace(&endpoint, name, &self.post_params(), &doc.to_object()?)
            .await
    }

    pub(crate) async fn apply_document(
        &self,
        resolver: &mut Resolver<'_>,
        doc: &Document,
    ) -> Result<DynamicObject> {
        match self.create_document(resolver, doc).await {
            Err(e) if e.is_already_exists() => {
                tracing::debug!(name = ?doc.name(), "already exists, updating");
                self.update_document(resolver, doc).await
            }
            other => other,
        }
    }

    pub(crate) async fn delete_document(
        &self,
        resolver: &mut Resolver<'_>,
        doc: &Document,
    ) -> Result<()> {
        let coords = resolver.resolve(doc).await?;
        let name = doc.require_name()?;
        let endpoint = self.endpoint(&coords, doc.namespace());
        self.transport
            .delete(&endpoint, name, &self.delete_params(&coords))
            .await
    }

    #[tracing::instrument(skip_all)]
    pub async fn create(&self, obj: impl Into<InputPayload>) -> Result<DynamicObject> {
        let doc = obj.into().normalize()?;
        self.create_document(&mut self.resolver(), &doc).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn update(&self, obj: impl Into<InputPayload>) -> Result<DynamicObject> {
        let doc = obj.into().normalize()?;
        self.update_document(&mut self.resolver(), &doc).await
    }

    /// Replaces the status subresource.
    #[tracing::instrument(skip_all)]
    pub async fn update_status(&self, obj: impl Into<InputPayload>) -> Result<DynamicObject> {
        let doc = obj.into().normalize()?;
        let coords = self.resolver().resolve(&doc).await?;
        let name = doc.require_name()?;
        let endpoint = self.endpoint(&coords, doc.namespace());
        self.transport
            .replace_status(&endpoint, name, &self.post_params(), doc.to_json()?)
            .await
    }

    /// Creates the object, or updates it if it already exists.
    #[tracing::instrument(skip_all)]
    pub async fn apply(&self, obj: impl Into<InputPayload>) -> Result<DynamicObject> {
        let doc = obj.into().normalize()?;
        self.apply_document(&mut self.resolver(), &doc).await
    }

    /// Deletes the object. Jobs and CronJobs default to background
    /// propagation so their pods go with them.
    #[tracing::instrument(skip_all)]
    pub async fn delete(&self, obj: impl Into<InputPayload>) -> Result<()> {
        let doc = obj.into().normalize()?;
        self.delete_document(&mut self.resolver(), &doc).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_by_name(&self, name: &str) -> Result<()> {
        let coords = self.configured_kind().await?;
        let endpoint = self.endpoint(&coords, None);
        self.transport
            .delete(&endpoint, name, &self.delete_params(&coords))
            .await
    }

    /// Fetches the current state of the object.
    #[tracing::instrument(skip_all)]
    pub async fn get(&self, obj: impl Into<InputPayload>) -> Result<DynamicObject> {
        let doc = obj.into().normalize()?;
        let coords = self.resolver().resolve(&doc).await?;
        let endpoint = self.endpoint(&coords, doc.namespace());
        self.transport.get(&endpoint, doc.require_name()?).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_name(&self, name: &str) -> Result<DynamicObject> {
        let coords = self.configured_kind().await?;
        self.transport.get(&self.endpoint(&coords, None), name).await
    }

    /// Lists objects of the configured kind, following continue tokens
    /// until the result is complete.
    #[tracing::instrument(skip(self))]
    pub async fn list(&self, selector: ListSelector) -> Result<Vec<DynamicObject>> {
        let coords = self.configured_kind().await?;
        let mut params = ListParams::default();
        params.timeout = self.options.timeout;
        params.limit = self.options.limit;
        let mut namespace = None;
        match selector {
            ListSelector::All => {}
            ListSelector::Labels(s) => params.label_selector = Some(s),
            ListSelector::Fields(s) => params.field_selector = Some(s),
            ListSelector::Namespace(ns) => {
                if !coords.namespaced {
                    return Err(Error::NotNamespaced {
                        resource: coords.resource,
                    });
                }
                namespace = Some(ns);
            }
        }
        let endpoint = self.endpoint(&coords, namespace.as_deref());

        let mut items = Vec::new();
        loop {
            let page = self.transport.list(&endpoint, &params).await?;
            items.extend(page.items);
            match page.continue_token {
                Some(token) => params.continue_token = Some(token),
                None => break,
            }
        }
        Ok(items)
    }

    pub async fn list_all(&self) -> Result<Vec<DynamicObject>> {
        self.list(ListSelector::All).await
    }

    pub async fn list_by_label(&self, selector: &str) -> Result<Vec<DynamicObject>> {
        self.list(ListSelector::Labels(selector.to_string())).await
    }

    pub async fn list_by_field(&self, selector: &str) -> Result<Vec<DynamicObject>> {
        self.list(ListSelector::Fields(selector.to_string())).await
    }

    pub async fn list_by_namespace(&self, namespace: &str) -> Result<Vec<DynamicObject>> {
        self.list(ListSelector::Namespace(namespace.to_string()))
            .await
    }

    /// Patches `original` with `source`.
    ///
    /// A path or bytes source is sent as the patch itself (YAML is converted
    /// to JSON). An object source is diffed against `original`. `kind`
    /// defaults to a strategic merge patch, which only built-in kinds support;
    /// use [`PatchKind::Merge`] for custom resources. Patches that change
    /// nothing are not sent and `original` is returned as is.
    #[tracing::instrument(skip(self, original, source))]
    pub async fn patch(
        &self,
        original: impl Into<InputPayload>,
        source: impl Into<InputPayload>,
        kind: Option<PatchKind>,
    ) -> Result<DynamicObject> {
        let doc = original.into().normalize()?;
        let coords = self.resolver().resolve(&doc).await?;
        let name = doc.require_name()?;
        let request = patch::build(&doc, &source.into(), kind)?;
        if request.is_noop() {
            tracing::debug!(name, "empty patch, nothing to send");
            return doc.to_object();
        }
        tracing::debug!(name, content_type = request.kind.content_type(), "sending patch");
        let endpoint = self.endpoint(&coords, doc.namespace());
        self.transport
            .patch(&endpoint, name, &self.patch_params(), &request.to_kube_patch()?)
            .await
    }

    /// Watches the configured kind until the retry policy gives up. Runs for
    /// as long as the watch does; drop the future to stop it.
    pub async fn watch<H: WatchHandler + ?Sized>(
        &self,
        target: WatchTarget,
        handler: &mut H,
    ) -> Result<()> {
        let coords = self.configured_kind().await?;
        WatchLoop::new(
            &*self.transport,
            self.endpoint(&coords, None),
            target,
            self.options.timeout,
            self.options.retry_policy,
        )
        .run(handler)
        .await
    }

    pub async fn watch_by_name<H: WatchHandler + ?Sized>(
        &self,
        name: &str,
        handler: &mut H,
    ) -> Result<()> {
        self.watch(WatchTarget::Name(name.to_string()), handler)
            .await
    }

    pub async fn watch_by_label<H: WatchHandler + ?Sized>(
        &self,
        selector: &str,
        handler: &mut H,
    ) -> Result<()> {
        self.watch(WatchTarget::Labels(selector.to_string()), handler)
            .await
    }

    pub async fn watch_by_field<H: WatchHandler + ?Sized>(
        &self,
        selector: &str,
        handler: &mut H,
    ) -> Result<()> {
        self.watch(WatchTarget::Fields(selector.to_string()), handler)
            .await
    }

    /// [`Handler::watch`] that also returns once `cancel` fires.
    pub async fn watch_until<H: WatchHandler + ?Sized>(
        &self,
        target: WatchTarget,
        handler: &mut H,
        cancel: CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            res = self.watch(target, handler) => res,
            _ = cancel.cancelled() => {
                tracing::info!("watch cancelled");
                Ok(())
            }
        }
    }
}
