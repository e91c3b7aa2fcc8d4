//! Subscription upserts from provider events
//!
//! Subscription rows are written only here. Each write is keyed by the
//! provider subscription id and carries the provider event timestamp, so an
//! older event arriving late never overwrites a newer one.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use marketplace_shared::{
    Account, Repository, SubscriptionStatus, SubscriptionUpsert, UpsertOutcome,
    LIVE_SUBSCRIPTION_CONSTRAINT,
};

use crate::client::PaymentProvider;
use crate::error::{BillingError, BillingResult};
use crate::payload::{SubscriptionObject, METADATA_ACCOUNT_ID, METADATA_PLAN_ID};

/// Map a Stripe subscription status to the internal lifecycle
pub fn map_status(provider_status: &str) -> BillingResult<SubscriptionStatus> {
    match provider_status {
        "active" => Ok(SubscriptionStatus::Active),
        "trialing" => Ok(SubscriptionStatus::Trialing),
        // Grace period while Stripe retries the card
        "past_due" => Ok(SubscriptionStatus::Active),
        "incomplete" => Ok(SubscriptionStatus::Pending),
        "incomplete_expired" => Ok(SubscriptionStatus::Expired),
        "canceled" | "unpaid" | "paused" => Ok(SubscriptionStatus::Cancelled),
        other => Err(BillingError::Validation(format!(
            "unknown subscription status '{}'",
            other
        ))),
    }
}

/// How the owning account was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountResolution {
    Metadata,
    CustomerId,
    CustomerEmail,
    /// Already attached to a stored subscription row
    ExistingSubscription,
}

impl AccountResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountResolution::Metadata => "metadata",
            AccountResolution::CustomerId => "customer_id",
            AccountResolution::CustomerEmail => "customer_email",
            AccountResolution::ExistingSubscription => "existing_subscription",
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionUpserter {
    repo: Arc<dyn Repository>,
    provider: Arc<dyn PaymentProvider>,
}

impl SubscriptionUpserter {
    pub fn new(repo: Arc<dyn Repository>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { repo, provider }
    }

    /// Apply a created/updated subscription object
    pub async fn upsert(
        &self,
        subscription: &SubscriptionObject,
        event_at: OffsetDateTime,
    ) -> BillingResult<UpsertOutcome> {
        let status = map_status(&subscription.status)?;
        self.write(subscription, status, event_at).await
    }

    /// Apply a deletion. Unknown subscriptions get an `expired` row so that a
    /// late `updated` event for them is recognised as stale.
    pub async fn expire(
        &self,
        subscription: &SubscriptionObject,
        event_at: OffsetDateTime,
    ) -> BillingResult<UpsertOutcome> {
        self.write(subscription, SubscriptionStatus::Expired, event_at)
            .await
    }

    async fn write(
        &self,
        subscription: &SubscriptionObject,
        status: SubscriptionStatus,
        event_at: OffsetDateTime,
    ) -> BillingResult<UpsertOutcome> {
        let existing = self
            .repo
            .get_subscription_by_external_id(&subscription.id)
            .await?;

        if let Some(current) = existing.as_ref() {
            if current.last_event_at > event_at {
                tracing::info!(
                    subscription_id = %subscription.id,
                    stored_event_at = %current.last_event_at,
                    event_at = %event_at,
                    "Ignoring out-of-order subscription event"
                );
                return Ok(UpsertOutcome::Stale(current.clone()));
            }
        }

        let (account, resolution) = self
            .resolve_account(subscription, existing.as_ref().map(|s| s.account_id))
            .await?;

        if let Some(current) = existing.as_ref() {
            if current.account_id != account.id {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    stored_account_id = %current.account_id,
                    resolved_account_id = %account.id,
                    "Subscription event resolves to a different account - keeping stored owner"
                );
            }
        }

        let plan_id = self
            .resolve_plan(subscription, existing.as_ref().map(|s| s.plan_id))
            .await?;

        if let Some(current) = existing.as_ref() {
            if current.plan_id != plan_id {
                tracing::info!(
                    subscription_id = %subscription.id,
                    old_plan_id = %current.plan_id,
                    new_plan_id = %plan_id,
                    "Subscription plan changed"
                );
            }
        }

        let upsert = SubscriptionUpsert {
            account_id: account.id,
            plan_id,
            status,
            current_period_start: subscription.period_start(),
            current_period_end: subscription.period_end(),
            cancel_at_period_end: subscription.cancel_at_period_end,
            external_subscription_id: subscription.id.clone(),
            event_at,
        };

        let outcome = self.repo.upsert_subscription(upsert).await.map_err(|e| {
            if e.violates(LIVE_SUBSCRIPTION_CONSTRAINT) {
                tracing::warn!(
                    account_id = %account.id,
                    subscription_id = %subscription.id,
                    "Account already holds a live subscription"
                );
                BillingError::LiveSubscriptionExists(account.id)
            } else {
                BillingError::from(e)
            }
        })?;

        match &outcome {
            UpsertOutcome::Inserted(row) | UpsertOutcome::Updated(row) => {
                tracing::info!(
                    account_id = %row.account_id,
                    subscription_id = %row.external_subscription_id,
                    status = %row.status,
                    cancel_at_period_end = row.cancel_at_period_end,
                    resolved_by = resolution.as_str(),
                    inserted = matches!(outcome, UpsertOutcome::Inserted(_)),
                    "Subscription synced"
                );
            }
            UpsertOutcome::Stale(row) => {
                tracing::info!(
                    subscription_id = %row.external_subscription_id,
                    "Subscription event superseded by a newer one"
                );
            }
        }

        Ok(outcome)
    }

    /// Find the owning account: metadata account id, then the stored
    /// customer mapping, then the customer's email.
    pub async fn resolve_account(
        &self,
        subscription: &SubscriptionObject,
        stored_owner: Option<Uuid>,
    ) -> BillingResult<(Account, AccountResolution)> {
        let customer_id = subscription.customer.as_ref().map(|c| c.id());

        if let Some(raw) = subscription.metadata.get(METADATA_ACCOUNT_ID) {
            match Uuid::parse_str(raw) {
                Ok(account_id) => {
                    if let Some(account) = self.repo.get_account(account_id).await? {
                        self.link_customer(&account, customer_id).await;
                        return Ok((account, AccountResolution::Metadata));
                    }
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        account_id = %account_id,
                        "Metadata account id does not exist"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        value = %raw,
                        "Metadata account id is not a UUID"
                    );
                }
            }
        }

        if let Some(customer_id) = customer_id {
            if let Some(account) = self.repo.find_account_by_customer_id(customer_id).await? {
                return Ok((account, AccountResolution::CustomerId));
            }

            let email = match subscription.customer.as_ref().and_then(|c| c.email()) {
                Some(email) => Some(email.to_string()),
                None => self.provider.customer_email(customer_id).await?,
            };

            if let Some(email) = email {
                if let Some(account) = self.repo.find_account_by_email(&email).await? {
                    self.link_customer(&account, Some(customer_id)).await;
                    return Ok((account, AccountResolution::CustomerEmail));
                }
            }
        }

        if let Some(owner) = stored_owner {
            if let Some(account) = self.repo.get_account(owner).await? {
                return Ok((account, AccountResolution::ExistingSubscription));
            }
        }

        tracing::error!(
            subscription_id = %subscription.id,
            customer_id = ?customer_id,
            "Unable to attribute subscription to an account"
        );
        Err(BillingError::UnresolvedAccount(subscription.id.clone()))
    }

    /// Plan from the event's price, falling back to checkout metadata and then
    /// the stored plan
    async fn resolve_plan(
        &self,
        subscription: &SubscriptionObject,
        stored_plan: Option<Uuid>,
    ) -> BillingResult<Uuid> {
        if let Some(price_id) = subscription.price_id() {
            if let Some(plan) = self.repo.find_subscription_plan_by_price(price_id).await? {
                return Ok(plan.id);
            }
            tracing::warn!(
                subscription_id = %subscription.id,
                price_id = %price_id,
                "No subscription plan for price"
            );
        }

        if let Some(plan_id) = subscription
            .metadata
            .get(METADATA_PLAN_ID)
            .and_then(|raw| Uuid::parse_str(raw).ok())
        {
            if self.repo.get_subscription_plan(plan_id).await?.is_some() {
                return Ok(plan_id);
            }
        }

        stored_plan.ok_or_else(|| {
            BillingError::NotFound(format!(
                "subscription plan for price {}",
                subscription.price_id().unwrap_or("<none>")
            ))
        })
    }

    async fn link_customer(&self, account: &Account, customer_id: Option<&str>) {
        let Some(customer_id) = customer_id else {
            return;
        };

        match account.external_customer_id.as_deref() {
            Some(existing) if existing == customer_id => {}
            Some(existing) => {
                tracing::warn!(
                    account_id = %account.id,
                    stored_customer_id = %existing,
                    event_customer_id = %customer_id,
                    "Account already mapped to another customer"
                );
            }
            None => {
                if let Err(e) = self.repo.link_customer_id(account.id, customer_id).await {
                    tracing::warn!(
                        account_id = %account.id,
                        customer_id = %customer_id,
                        error = %e,
                        "Failed to link customer id"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("active").unwrap(), SubscriptionStatus::Active);
        assert_eq!(map_status("trialing").unwrap(), SubscriptionStatus::Trialing);
        assert_eq!(map_status("past_due").unwrap(), SubscriptionStatus::Active);
        assert_eq!(map_status("incomplete").unwrap(), SubscriptionStatus::Pending);
        assert_eq!(
            map_status("incomplete_expired").unwrap(),
            SubscriptionStatus::Expired
        );
        for cancelled in ["canceled", "unpaid", "paused"] {
            assert_eq!(map_status(cancelled).unwrap(), SubscriptionStatus::Cancelled);
        }
    }

    #[test]
    fn test_unknown_status_is_a_validation_error() {
        assert!(matches!(
            map_status("on_fire"),
            Err(BillingError::Validation(_))
        ));
    }
}
