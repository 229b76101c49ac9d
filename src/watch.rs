//! Turns server-terminated watch streams into a durable add/modify/delete
//! notification channel.
//!
//! Each session first checks whether the watched object (or any object
//! matching the selector) exists, then subscribes. The server replays `Added`
//! for objects that already exist; those replays are not reported as adds.
//! When the server closes the stream the session starts over.
//!
//! Events emitted while a session reconnects can be missed. Callers that need
//! every transition must reconcile from a `get`/`list` in their callbacks.

use crate::{
    errors::Result,
    transport::{Endpoint, Transport},
};
use futures::StreamExt;
use kube::{
    api::{ListParams, WatchEvent, WatchParams},
    core::DynamicObject,
};
use rand::distributions::Distribution;
use std::time::Duration;

/// Longest server-side watch timeout the API server accepts.
const MAX_WATCH_TIMEOUT: u32 = 290;

/// What a watch session observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// A single object by name
    Name(String),
    /// Objects matching a label selector
    Labels(String),
    /// Objects matching a field selector
    Fields(String),
}

impl WatchTarget {
    fn field_selector(&self) -> Option<String> {
        match self {
            WatchTarget::Name(name) => Some(format!("metadata.name={}", name)),
            WatchTarget::Fields(selector) => Some(selector.clone()),
            WatchTarget::Labels(_) => None,
        }
    }

    fn label_selector(&self) -> Option<String> {
        match self {
            WatchTarget::Labels(selector) => Some(selector.clone()),
            _ => None,
        }
    }
}

/// Receives the notifications of a watch session.
pub trait WatchHandler: Send {
    fn on_add(&mut self, obj: &DynamicObject);
    fn on_modify(&mut self, obj: &DynamicObject);
    fn on_delete(&mut self, obj: &DynamicObject);
}

/// [`WatchHandler`] made of three closures.
pub struct Callbacks<A, M, D> {
    on_add: A,
    on_modify: M,
    on_delete: D,
}

pub fn callbacks<A, M, D>(on_add: A, on_modify: M, on_delete: D) -> Callbacks<A, M, D>
where
    A: FnMut(&DynamicObject) + Send,
    M: FnMut(&DynamicObject) + Send,
    D: FnMut(&DynamicObject) + Send,
{
    Callbacks {
        on_add,
        on_modify,
        on_delete,
    }
}

impl<A, M, D> WatchHandler for Callbacks<A, M, D>
where
    A: FnMut(&DynamicObject) + Send,
    M: FnMut(&DynamicObject) + Send,
    D: FnMut(&DynamicObject) + Send,
{
    fn on_add(&mut self, obj: &DynamicObject) {
        (self.on_add)(obj)
    }

    fn on_modify(&mut self, obj: &DynamicObject) {
        (self.on_modify)(obj)
    }

    fn on_delete(&mut self, obj: &DynamicObject) {
        (self.on_delete)(obj)
    }
}

/// Delay between a closed stream and the next session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    /// Reconnect immediately
    #[default]
    None,
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before reconnect number `attempt` (starting at 1).
    /// Actually it will be multiplied by a random number in 1.0..1.1
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        let base = match *self {
            Backoff::None => return None,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(max).min(max)
            }
        };
        let dist = rand::distributions::Uniform::new(1.0, 1.1);
        let jitter = dist.sample(&mut rand::thread_rng());
        Some(Duration::try_from_secs_f64(base.as_secs_f64() * jitter).unwrap_or(base))
    }
}

/// How a watch reacts to the server closing the stream.
///
/// The default reconnects immediately and forever, which is what the API
/// server's periodic disconnects call for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` reconnects forever.
    pub max_reconnects: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn bounded(max_reconnects: u32) -> Self {
        RetryPolicy {
            max_reconnects: Some(max_reconnects),
            ..Default::default()
        }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        RetryPolicy { backoff, ..self }
    }
}

/// One watch on one endpoint, reconnecting per its [`RetryPolicy`].
pub struct WatchLoop<'a> {
    transport: &'a dyn Transport,
    endpoint: Endpoint,
    target: WatchTarget,
    timeout: Option<u32>,
    policy: RetryPolicy,
}

impl<'a> WatchLoop<'a> {
    /// `timeout` is the server-side watch timeout in seconds; `None` leaves it
    /// to the server.
    pub fn new(
        transport: &'a dyn Transport,
        endpoint: Endpoint,
        target: WatchTarget,
        timeout: Option<u32>,
        policy: RetryPolicy,
    ) -> Self {
        WatchLoop {
            transport,
            endpoint,
            target,
            timeout,
            policy,
        }
    }

    async fn exists(&self) -> Result<bool> {
        match &self.target {
            WatchTarget::Name(name) => match self.transport.get(&self.endpoint, name).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            },
            target => {
                let mut params = ListParams::default().limit(1);
                params.label_selector = target.label_selector();
                params.field_selector = target.field_selector();
                let page = self.transport.list(&self.endpoint, &params).await?;
                Ok(!page.items.is_empty())
            }
        }
    }

    fn watch_params(&self) -> WatchParams {
        let mut params = WatchParams::default();
        params.label_selector = self.target.label_selector();
        params.field_selector = self.target.field_selector();
        params.timeout = self.timeout.map(|t| t.min(MAX_WATCH_TIMEOUT));
        params
    }

    /// Runs sessions until the retry policy is exhausted. Failing to check
    /// existence or to open the watch ends the loop with that error.
    #[tracing::instrument(skip_all, fields(resource = %self.endpoint.resource.plural, target = ?self.target))]
    pub async fn run<H: WatchHandler + ?Sized>(&self, handler: &mut H) -> Result<()> {
        let params = self.watch_params();
        let mut reconnects = 0u32;
        loop {
            let mut exists = self.exists().await?;
            let mut stream = self.transport.watch(&self.endpoint, &params, "0").await?;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => dispatch(&mut exists, event, handler),
                    Err(e) => tracing::warn!(error = %e, "watch stream returned an error"),
                }
            }
            if self
                .policy
                .max_reconnects
                .map_or(false, |max| reconnects >= max)
            {
                tracing::info!(reconnects, "watch closed, reconnect limit reached");
                return Ok(());
            }
            reconnects += 1;
            tracing::info!(reconnects, "watch closed, reconnecting");
            if let Some(delay) = self.policy.backoff.delay(reconnects) {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn dispatch<H: WatchHandler + ?Sized>(
    exists: &mut bool,
    event: WatchEvent<DynamicObject>,
    handler: &mut H,
) {
    match event {
        WatchEvent::Added(obj) => {
            if !*exists {
                handler.on_add(&obj);
            }
            *exists = true;
        }
        WatchEvent::Modified(obj) => {
            handler.on_modify(&obj);
            *exists = true;
        }
        WatchEvent::Deleted(obj) => {
            handler.on_delete(&obj);
            *exists = false;
        }
        WatchEvent::Bookmark(_) => tracing::debug!("bookmark"),
        WatchEvent::Error(e) => {
            tracing::debug!(code = e.code, reason = %e.reason, message = %e.message, "watch error event")
        }
    }
}
