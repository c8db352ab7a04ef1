//! Outbound alert delivery.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::domain::{SubjectKey, UtcDateTime};
use crate::gate::AlertClass;
use crate::http_client::{HttpClient, HttpRequest};
use crate::SyncError;

type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send + 'a>>;

/// Chat channel or user reference an alert is routed to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTarget(String);

impl DeliveryTarget {
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeliveryTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertMessage {
    pub class: AlertClass,
    pub subject: SubjectKey,
    pub title: String,
    pub body: String,
    /// Value the gate deduplicates on.
    pub value: Value,
    pub raised_at: UtcDateTime,
}

impl AlertMessage {
    fn render(&self) -> String {
        format!("**{}**\n{}", self.title, self.body)
    }
}

/// Notification delivery collaborator.
pub trait AlertSink: Send + Sync {
    fn deliver<'a>(&'a self, target: &'a DeliveryTarget, message: &'a AlertMessage)
        -> DeliveryFuture<'a>;
}

/// Posts alerts as JSON to chat webhooks. Each target maps to its own webhook
/// URL; unknown targets use the default URL. Deliveries share one `governor`
/// quota so a burst of alerts cannot trip the chat service's own limits.
pub struct WebhookSink {
    http_client: Arc<dyn HttpClient>,
    routes: BTreeMap<String, String>,
    default_url: Option<String>,
    limiter: DefaultDirectRateLimiter,
    timeout_ms: u64,
}

impl WebhookSink {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        default_url: Option<String>,
        per_minute: NonZeroU32,
        timeout_ms: u64,
    ) -> Self {
        Self {
            http_client,
            routes: BTreeMap::new(),
            default_url,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            timeout_ms,
        }
    }

    pub fn with_route(mut self, target: impl Into<String>, url: impl Into<String>) -> Self {
        self.routes.insert(target.into(), url.into());
        self
    }

    fn url_for(&self, target: &DeliveryTarget) -> Option<&str> {
        self.routes
            .get(target.as_str())
            .or(self.default_url.as_ref())
            .map(String::as_str)
    }

    async fn deliver_inner(
        &self,
        target: &DeliveryTarget,
        message: &AlertMessage,
    ) -> Result<(), SyncError> {
        let url = self.url_for(target).ok_or_else(|| {
            SyncError::Delivery(format!("no webhook configured for target '{target}'"))
        })?;

        self.limiter.until_ready().await;

        let payload = json!({
            "username": "ferrowatch",
            "content": message.render(),
        });
        let request = HttpRequest::post(url)
            .with_header("content-type", "application/json")
            .with_body(payload.to_string())
            .with_timeout_ms(self.timeout_ms);

        let response = self
            .http_client
            .execute(request)
            .await
            .map_err(|error| SyncError::Delivery(error.to_string()))?;

        if response.status == 429 {
            warn!(%target, class = %message.class, "webhook rate limited delivery");
            return Err(SyncError::Delivery(String::from("webhook rate limited")));
        }
        if !response.is_success() {
            return Err(SyncError::Delivery(format!(
                "webhook returned status {}",
                response.status
            )));
        }

        debug!(%target, class = %message.class, subject = %message.subject, "alert delivered");
        Ok(())
    }
}

impl AlertSink for WebhookSink {
    fn deliver<'a>(
        &'a self,
        target: &'a DeliveryTarget,
        message: &'a AlertMessage,
    ) -> DeliveryFuture<'a> {
        Box::pin(self.deliver_inner(target, message))
    }
}

/// Dry-run sink: logs instead of sending.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn deliver<'a>(
        &'a self,
        target: &'a DeliveryTarget,
        message: &'a AlertMessage,
    ) -> DeliveryFuture<'a> {
        Box::pin(async move {
            info!(
                %target,
                class = %message.class,
                subject = %message.subject,
                title = %message.title,
                "[DRY RUN] would deliver alert"
            );
            Ok(())
        })
    }
}

/// Keeps every delivered alert in memory. Can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(DeliveryTarget, AlertMessage)>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<(DeliveryTarget, AlertMessage)> {
        self.delivered
            .lock()
            .expect("recording sink lock is not poisoned")
            .clone()
    }
}

impl AlertSink for RecordingSink {
    fn deliver<'a>(
        &'a self,
        target: &'a DeliveryTarget,
        message: &'a AlertMessage,
    ) -> DeliveryFuture<'a> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncError::Delivery(format!("delivery to '{target}' refused")));
            }
            self.delivered
                .lock()
                .expect("recording sink lock is not poisoned")
                .push((target.clone(), message.clone()));
            Ok(())
        })
    }
}
