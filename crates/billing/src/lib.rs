// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError variants carry provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Marketplace Billing Module
//!
//! Entitlement and boost reconciliation for the marketplace.
//!
//! ## Features
//!
//! - **Entitlement**: Listing-creation quota from account type and subscription plan
//! - **Boosts**: Purchase/activation ledger extending a listing's promotion window
//! - **Checkout**: Stripe Checkout sessions for boosts and subscriptions
//! - **Webhooks**: Verified, deduplicated reconciliation of Stripe events
//! - **Subscriptions**: Subscription rows kept in step with Stripe, out-of-order safe
//! - **Notifications**: Best-effort "listing boosted" / "subscription changed" delivery
//! - **Invariants**: Read-only consistency checks over the store

pub mod boost;
pub mod checkout;
pub mod client;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod notifications;
pub mod payload;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod test_support;

// Boosts
pub use boost::{extend_boost_window, ActivationOutcome, BoostLedger, PurchaseRequest};

// Checkout
pub use checkout::{
    BoostCheckoutRequest, CheckoutResponse, CheckoutService, SubscriptionCheckoutRequest,
};

// Client
pub use client::{
    CheckoutMode, CheckoutSessionRequest, CreatedCheckoutSession, PaymentProvider, StripeClient,
    WebhookVerifier,
};

// Config
pub use config::{BillingConfig, StripeConfig};

// Entitlement
pub use entitlement::{EntitlementService, Quota, FREE_TIER_MAX_LISTINGS};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notifications::{
    HttpSink, Notification, NotificationDispatcher, NotificationSink, RetryPolicy, TracingSink,
};

// Subscriptions
pub use subscriptions::{map_status, AccountResolution, SubscriptionUpserter};

// Webhooks
pub use webhooks::{RejectReason, WebhookAck, WebhookHandler, WebhookResponse};

use std::sync::Arc;

use marketplace_shared::{connect_repository, Repository};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub entitlement: EntitlementService,
    pub boosts: BoostLedger,
    pub checkout: CheckoutService,
    pub subscriptions: SubscriptionUpserter,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Build the service from environment configuration, connecting the
    /// configured store and the Stripe client.
    pub async fn from_env() -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let repo = connect_repository(config.store_backend, config.database_url.as_deref()).await?;
        let provider: Arc<dyn PaymentProvider> = Arc::new(StripeClient::new(config.stripe.clone()));
        let notifier = NotificationDispatcher::from_url(config.notification_webhook_url.as_deref())?;

        tracing::info!(
            store = ?config.store_backend,
            boost_max_horizon_days = ?config.boost_max_horizon_days,
            "Billing service configured"
        );

        Ok(Self::new(&config, repo, provider, notifier))
    }

    /// Create a billing service over explicit collaborators
    pub fn new(
        config: &BillingConfig,
        repo: Arc<dyn Repository>,
        provider: Arc<dyn PaymentProvider>,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self::with_parts(repo, provider, notifier, config.boost_max_horizon_days)
    }

    pub(crate) fn with_parts(
        repo: Arc<dyn Repository>,
        provider: Arc<dyn PaymentProvider>,
        notifier: NotificationDispatcher,
        boost_max_horizon_days: Option<i64>,
    ) -> Self {
        let boosts = BoostLedger::new(Arc::clone(&repo));
        let subscriptions = SubscriptionUpserter::new(Arc::clone(&repo), Arc::clone(&provider));

        Self {
            entitlement: EntitlementService::new(Arc::clone(&repo)),
            checkout: CheckoutService::new(
                Arc::clone(&repo),
                Arc::clone(&provider),
                boosts.clone(),
                boost_max_horizon_days,
            ),
            webhooks: WebhookHandler::new(
                repo,
                provider,
                boosts.clone(),
                subscriptions.clone(),
                notifier,
            ),
            boosts,
            subscriptions,
        }
    }
}
