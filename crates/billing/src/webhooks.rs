//! Stripe webhook reconciliation
//!
//! Applies verified provider events to internal state exactly once:
//!
//! 1. Verify the signature; reject without touching state on failure.
//! 2. Skip events already recorded as processed.
//! 3. Dispatch on event type (boost activation or subscription upsert).
//! 4. Record the event as processed only after dispatch succeeded.
//!
//! A failed dispatch leaves no processed record, so the provider's redelivery
//! is the recovery path. Ledger and subscription writes are idempotent on
//! their own, which makes that redelivery safe.

use std::sync::Arc;

use uuid::Uuid;

use marketplace_shared::{LedgerAction, Repository, UpsertOutcome};

use crate::boost::{ActivationOutcome, BoostLedger};
use crate::client::PaymentProvider;
use crate::error::{BillingError, BillingResult};
use crate::notifications::{Notification, NotificationDispatcher};
use crate::payload::{
    CheckoutSessionObject, EventKind, SubscriptionObject, WebhookEvent, METADATA_LISTING_ID,
    METADATA_PLAN_ID,
};
use crate::subscriptions::SubscriptionUpserter;

/// What happened to an accepted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    /// Dispatched and recorded
    Processed,
    /// Already recorded; nothing was dispatched
    Duplicate,
    /// Event type or checkout purpose this engine does not act on
    Ignored,
    /// Checkout completed but payment is still pending
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSignature,
    /// Malformed event; redelivery will not help
    Invalid,
    /// Left unprocessed so the provider redelivers
    Retry,
}

/// The only thing the provider learns about an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookResponse {
    Ack(WebhookAck),
    Reject(RejectReason),
}

impl WebhookResponse {
    pub fn is_ack(&self) -> bool {
        matches!(self, WebhookResponse::Ack(_))
    }

    /// HTTP status for the route layer; Stripe retries on non-2xx
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookResponse::Ack(_) => 200,
            WebhookResponse::Reject(RejectReason::InvalidSignature)
            | WebhookResponse::Reject(RejectReason::Invalid) => 400,
            WebhookResponse::Reject(RejectReason::Retry) => 500,
        }
    }
}

struct Dispatched {
    ack: WebhookAck,
    notifications: Vec<Notification>,
}

impl Dispatched {
    fn ack(ack: WebhookAck) -> Self {
        Self {
            ack,
            notifications: Vec::new(),
        }
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    repo: Arc<dyn Repository>,
    provider: Arc<dyn PaymentProvider>,
    boosts: BoostLedger,
    subscriptions: SubscriptionUpserter,
    notifier: NotificationDispatcher,
}

impl WebhookHandler {
    pub fn new(
        repo: Arc<dyn Repository>,
        provider: Arc<dyn PaymentProvider>,
        boosts: BoostLedger,
        subscriptions: SubscriptionUpserter,
        notifier: NotificationDispatcher,
    ) -> Self {
        Self {
            repo,
            provider,
            boosts,
            subscriptions,
            notifier,
        }
    }

    /// Handle a raw webhook delivery and decide accept or reject.
    ///
    /// Error detail is logged, never returned.
    pub async fn handle_event(&self, payload: &str, signature: &str) -> WebhookResponse {
        match self.process(payload, signature).await {
            Ok(ack) => WebhookResponse::Ack(ack),
            Err(BillingError::WebhookSignatureInvalid) => {
                tracing::warn!(
                    payload_len = payload.len(),
                    "Rejected webhook with invalid signature"
                );
                WebhookResponse::Reject(RejectReason::InvalidSignature)
            }
            Err(e) if e.is_retryable() => WebhookResponse::Reject(RejectReason::Retry),
            Err(_) => WebhookResponse::Reject(RejectReason::Invalid),
        }
    }

    /// Verify, deduplicate, dispatch and record one event
    pub async fn process(&self, payload: &str, signature: &str) -> BillingResult<WebhookAck> {
        let event = self.provider.verify_webhook(payload, signature)?;
        let event_id = event.id.clone();

        if self.repo.has_processed_event(&event_id).await.map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Processed-event lookup failed");
            BillingError::from(e)
        })? {
            tracing::info!(
                event_id = %event_id,
                event_type = %event.event_type,
                "Duplicate webhook event - already processed"
            );
            return Ok(WebhookAck::Duplicate);
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let dispatched = match self.dispatch(&event).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event.event_type,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Webhook dispatch failed - event left unprocessed"
                );
                return Err(e);
            }
        };

        match self
            .repo
            .insert_processed_event(&event_id, &event.event_type)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                tracing::info!(
                    event_id = %event_id,
                    "Event recorded concurrently by another delivery"
                );
            }
            Err(e) => {
                // State is committed; redelivery re-runs idempotent writes
                tracing::error!(
                    event_id = %event_id,
                    error = %e,
                    "Failed to record processed event"
                );
                return Err(e.into());
            }
        }

        for notification in dispatched.notifications {
            self.notifier.enqueue(notification);
        }

        Ok(dispatched.ack)
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<Dispatched> {
        match event.kind() {
            EventKind::CheckoutSessionCompleted => {
                let session: CheckoutSessionObject = event.object()?;
                self.handle_checkout(event, session, false).await
            }
            EventKind::CheckoutSessionAsyncPaymentSucceeded => {
                let session: CheckoutSessionObject = event.object()?;
                self.handle_checkout(event, session, true).await
            }
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                let subscription: SubscriptionObject = event.object()?;
                let outcome = self
                    .subscriptions
                    .upsert(&subscription, event.created_at())
                    .await?;
                Ok(subscription_dispatched(outcome))
            }
            EventKind::SubscriptionDeleted => {
                let subscription: SubscriptionObject = event.object()?;
                let outcome = self
                    .subscriptions
                    .expire(&subscription, event.created_at())
                    .await?;
                Ok(subscription_dispatched(outcome))
            }
            EventKind::InvoicePaymentSucceeded => {
                tracing::info!(event_id = %event.id, "Invoice paid");
                Ok(Dispatched::ack(WebhookAck::Processed))
            }
            EventKind::InvoicePaymentFailed => {
                tracing::warn!(event_id = %event.id, "Invoice payment failed");
                Ok(Dispatched::ack(WebhookAck::Processed))
            }
            EventKind::Other => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(Dispatched::ack(WebhookAck::Ignored))
            }
        }
    }

    async fn handle_checkout(
        &self,
        event: &WebhookEvent,
        session: CheckoutSessionObject,
        payment_confirmed: bool,
    ) -> BillingResult<Dispatched> {
        if !session.is_boost() {
            // Subscription checkouts are reconciled through subscription events
            tracing::info!(
                event_id = %event.id,
                session_id = %session.id,
                "Checkout session is not a boost purchase - ignoring"
            );
            return Ok(Dispatched::ack(WebhookAck::Ignored));
        }

        if !payment_confirmed && !session.is_paid() {
            tracing::info!(
                event_id = %event.id,
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "Boost checkout awaiting payment - activation deferred"
            );
            return Ok(Dispatched::ack(WebhookAck::Deferred));
        }

        self.check_session_metadata(&session).await?;

        match self.boosts.activate(&session.id).await? {
            ActivationOutcome::Activated {
                listing_id,
                account_id,
                boosted_until,
                ..
            } => Ok(Dispatched {
                ack: WebhookAck::Processed,
                notifications: vec![Notification::ListingBoosted {
                    account_id,
                    listing_id,
                    session_id: session.id,
                    boosted_until,
                }],
            }),
            ActivationOutcome::AlreadyActivated => Ok(Dispatched::ack(WebhookAck::Processed)),
        }
    }

    /// Session metadata must agree with what was recorded at purchase
    async fn check_session_metadata(&self, session: &CheckoutSessionObject) -> BillingResult<()> {
        let Some(purchase) = self
            .repo
            .get_ledger_entry(&session.id, LedgerAction::Purchased)
            .await?
        else {
            // Activation reports the missing purchase
            return Ok(());
        };

        let mismatch = |key: &str, expected: Uuid| -> bool {
            session
                .metadata
                .get(key)
                .is_some_and(|raw| Uuid::parse_str(raw).ok() != Some(expected))
        };

        if mismatch(METADATA_LISTING_ID, purchase.listing_id)
            || mismatch(METADATA_PLAN_ID, purchase.plan_id)
        {
            tracing::error!(
                session_id = %session.id,
                metadata = ?session.metadata,
                listing_id = %purchase.listing_id,
                plan_id = %purchase.plan_id,
                "Checkout metadata disagrees with recorded purchase"
            );
            return Err(BillingError::Validation(format!(
                "metadata for session {} does not match the recorded purchase",
                session.id
            )));
        }

        if let Some(amount) = session.amount_total {
            if amount != purchase.amount_cents {
                tracing::warn!(
                    session_id = %session.id,
                    amount_total = amount,
                    recorded_cents = purchase.amount_cents,
                    "Checkout amount differs from recorded purchase"
                );
            }
        }

        Ok(())
    }
}

fn subscription_dispatched(outcome: UpsertOutcome) -> Dispatched {
    match outcome {
        UpsertOutcome::Stale(_) => Dispatched::ack(WebhookAck::Processed),
        UpsertOutcome::Inserted(row) | UpsertOutcome::Updated(row) => Dispatched {
            ack: WebhookAck::Processed,
            notifications: vec![Notification::SubscriptionChanged {
                account_id: row.account_id,
                external_subscription_id: row.external_subscription_id,
                status: row.status,
                cancel_at_period_end: row.cancel_at_period_end,
            }],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_status_codes() {
        assert_eq!(WebhookResponse::Ack(WebhookAck::Duplicate).status_code(), 200);
        assert_eq!(
            WebhookResponse::Reject(RejectReason::InvalidSignature).status_code(),
            400
        );
        assert_eq!(WebhookResponse::Reject(RejectReason::Invalid).status_code(), 400);
        assert_eq!(WebhookResponse::Reject(RejectReason::Retry).status_code(), 500);
    }
}
