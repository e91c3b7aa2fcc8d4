//! Best-effort notifications
//!
//! Notifications are enqueued only after reconciliation has committed its
//! state. Each one is delivered on its own task with jittered exponential
//! backoff; a delivery that exhausts its retries is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use marketplace_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    ListingBoosted {
        account_id: Uuid,
        listing_id: Uuid,
        session_id: String,
        #[serde(with = "time::serde::rfc3339")]
        boosted_until: OffsetDateTime,
    },
    SubscriptionChanged {
        account_id: Uuid,
        external_subscription_id: String,
        status: SubscriptionStatus,
        cancel_at_period_end: bool,
    },
}

impl Notification {
    pub fn account_id(&self) -> Uuid {
        match self {
            Notification::ListingBoosted { account_id, .. }
            | Notification::SubscriptionChanged { account_id, .. } => *account_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Notification::ListingBoosted { .. } => "listing_boosted",
            Notification::SubscriptionChanged { .. } => "subscription_changed",
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> BillingResult<()>;
}

/// Sink that only records notifications in the log
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notification: &Notification) -> BillingResult<()> {
        tracing::info!(
            notification = notification.name(),
            account_id = %notification.account_id(),
            "Notification emitted"
        );
        Ok(())
    }
}

/// Sink that POSTs notifications as JSON to a configured endpoint
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BillingError::Config(format!("notification client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for HttpSink {
    async fn deliver(&self, notification: &Notification) -> BillingResult<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BillingError::Transient(format!("notification delivery: {}", e)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay multiplier; attempt `n` waits roughly `2^n * factor_ms`
    pub factor_ms: u64,
    pub max_delay: Duration,
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            factor_ms: 100,
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

/// Hands notifications to a sink off the reconciliation path
#[derive(Clone)]
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
    policy: RetryPolicy,
}

impl NotificationDispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self::with_policy(sink, RetryPolicy::default())
    }

    pub fn with_policy(sink: Arc<dyn NotificationSink>, policy: RetryPolicy) -> Self {
        Self { sink, policy }
    }

    /// HTTP sink when a URL is configured, otherwise log-only
    pub fn from_url(url: Option<&str>) -> BillingResult<Self> {
        let sink: Arc<dyn NotificationSink> = match url {
            Some(url) => Arc::new(HttpSink::new(url)?),
            None => Arc::new(TracingSink),
        };
        Ok(Self::new(sink))
    }

    /// Spawn delivery and return immediately. The handle may be awaited but
    /// never needs to be; delivery failures are logged, not returned.
    pub fn enqueue(&self, notification: Notification) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let policy = self.policy;

        tokio::spawn(async move {
            let strategy = ExponentialBackoff::from_millis(2)
                .factor(policy.factor_ms)
                .max_delay(policy.max_delay)
                .map(jitter)
                .take(policy.max_retries);

            let result = Retry::spawn(strategy, || {
                let sink = Arc::clone(&sink);
                let notification = notification.clone();
                async move { sink.deliver(&notification).await }
            })
            .await;

            if let Err(e) = result {
                tracing::warn!(
                    notification = notification.name(),
                    account_id = %notification.account_id(),
                    error = %e,
                    "Notification dropped after retries"
                );
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    /// Records delivered notifications; fails the first `failures` attempts
    #[derive(Default)]
    pub struct RecordingSink {
        pub delivered: Mutex<Vec<Notification>>,
        pub attempts: AtomicUsize,
        pub failures: usize,
    }

    impl RecordingSink {
        pub fn failing(failures: usize) -> Self {
            Self {
                failures,
                ..Default::default()
            }
        }

        pub async fn delivered(&self) -> Vec<Notification> {
            self.delivered.lock().await.clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, notification: &Notification) -> BillingResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(BillingError::Transient("sink down".to_string()));
            }
            self.delivered.lock().await.push(notification.clone());
            Ok(())
        }
    }

    pub fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            factor_ms: 1,
            max_delay: Duration::from_millis(5),
            max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{fast_policy, RecordingSink};
    use super::*;

    fn boosted() -> Notification {
        Notification::ListingBoosted {
            account_id: Uuid::new_v4(),
            listing_id: Uuid::new_v4(),
            session_id: "cs_1".to_string(),
            boosted_until: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_delivery_retries_until_sink_recovers() {
        let sink = Arc::new(RecordingSink::failing(2));
        let dispatcher = NotificationDispatcher::with_policy(sink.clone(), fast_policy(5));

        dispatcher.enqueue(boosted()).await.unwrap();

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sink.delivered().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dropped_quietly() {
        let sink = Arc::new(RecordingSink::failing(usize::MAX));
        let dispatcher = NotificationDispatcher::with_policy(sink.clone(), fast_policy(2));

        // The task completes normally even though delivery never succeeded
        dispatcher.enqueue(boosted()).await.unwrap();

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert!(sink.delivered().await.is_empty());
    }

    #[test]
    fn test_notification_wire_format() {
        let json = serde_json::to_value(boosted()).unwrap();
        assert_eq!(json["event"], "listing_boosted");
        assert_eq!(json["boosted_until"], "1970-01-01T00:00:00Z");
    }
}
