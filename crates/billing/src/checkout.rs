//! Checkout session creation
//!
//! Boost checkouts write the `purchased` ledger row as soon as the provider
//! session exists, so the later payment webhook can find what was bought.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use marketplace_shared::{Account, Repository};

use crate::boost::{add_days, extend_boost_window, BoostLedger, PurchaseRequest};
use crate::client::{CheckoutMode, CheckoutSessionRequest, PaymentProvider};
use crate::error::{BillingError, BillingResult};
use crate::payload::{
    METADATA_ACCOUNT_ID, METADATA_LISTING_ID, METADATA_PLAN_ID, METADATA_TYPE,
    METADATA_TYPE_BOOST, METADATA_TYPE_SUBSCRIPTION,
};

#[derive(Debug, Clone)]
pub struct BoostCheckoutRequest {
    pub account_id: Uuid,
    pub listing_id: Uuid,
    pub boost_plan_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionCheckoutRequest {
    pub account_id: Uuid,
    pub subscription_plan_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    repo: Arc<dyn Repository>,
    provider: Arc<dyn PaymentProvider>,
    boosts: BoostLedger,
    /// Furthest a purchase may push a boost window, in days from now
    max_horizon_days: Option<i64>,
}

impl CheckoutService {
    pub fn new(
        repo: Arc<dyn Repository>,
        provider: Arc<dyn PaymentProvider>,
        boosts: BoostLedger,
        max_horizon_days: Option<i64>,
    ) -> Self {
        Self {
            repo,
            provider,
            boosts,
            max_horizon_days,
        }
    }

    pub async fn create_boost_checkout(
        &self,
        request: BoostCheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        self.create_boost_checkout_at(request, OffsetDateTime::now_utc())
            .await
    }

    pub async fn create_boost_checkout_at(
        &self,
        request: BoostCheckoutRequest,
        now: OffsetDateTime,
    ) -> BillingResult<CheckoutResponse> {
        validate_urls(&request.success_url, &request.cancel_url)?;
        let account = self.load_account(request.account_id).await?;

        let listing = self
            .repo
            .get_listing(request.listing_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("listing {}", request.listing_id)))?;

        if listing.owner_id != account.id {
            tracing::warn!(
                account_id = %account.id,
                listing_id = %listing.id,
                "Boost checkout for a listing owned by another account"
            );
            return Err(BillingError::Validation(
                "listing does not belong to this account".to_string(),
            ));
        }
        if listing.deleted_at.is_some() {
            return Err(BillingError::Validation(
                "cannot boost a deleted listing".to_string(),
            ));
        }

        let plan = self
            .repo
            .get_boost_plan(request.boost_plan_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("boost plan {}", request.boost_plan_id))
            })?;

        let projected = extend_boost_window(listing.boosted_until, now, plan.duration_days)
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "boost plan {} duration of {} days is out of range",
                    plan.id, plan.duration_days
                ))
            })?;

        if let Some(horizon_days) = self.max_horizon_days {
            // A ceiling past the representable range never binds
            if let Some(ceiling) = add_days(now, horizon_days) {
                if projected > ceiling {
                    return Err(BillingError::Validation(format!(
                        "boost would extend past the {} day limit",
                        horizon_days
                    )));
                }
            }
        }

        let metadata = HashMap::from([
            (METADATA_TYPE.to_string(), METADATA_TYPE_BOOST.to_string()),
            (METADATA_ACCOUNT_ID.to_string(), account.id.to_string()),
            (METADATA_LISTING_ID.to_string(), listing.id.to_string()),
            (METADATA_PLAN_ID.to_string(), plan.id.to_string()),
        ]);

        let session = self
            .provider
            .create_checkout_session(CheckoutSessionRequest {
                mode: CheckoutMode::Payment,
                price_id: plan.external_price_id.clone(),
                success_url: request.success_url,
                cancel_url: request.cancel_url,
                metadata,
                customer_id: account.external_customer_id.clone(),
            })
            .await?;

        let recorded = self
            .boosts
            .record_purchase(PurchaseRequest {
                listing_id: listing.id,
                plan_id: plan.id,
                account_id: account.id,
                external_session_id: session.session_id.clone(),
                amount_cents: plan.price_cents,
            })
            .await;

        match recorded {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {}
            Err(e) => {
                tracing::error!(
                    session_id = %session.session_id,
                    listing_id = %listing.id,
                    error = %e,
                    "Failed to record boost purchase for created session"
                );
                return Err(e);
            }
        }

        tracing::info!(
            account_id = %account.id,
            listing_id = %listing.id,
            plan = %plan.name,
            session_id = %session.session_id,
            "Boost checkout created"
        );

        Ok(CheckoutResponse {
            session_id: session.session_id,
            url: session.url,
        })
    }

    pub async fn create_subscription_checkout(
        &self,
        request: SubscriptionCheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        validate_urls(&request.success_url, &request.cancel_url)?;
        let account = self.load_account(request.account_id).await?;

        let plan = self
            .repo
            .get_subscription_plan(request.subscription_plan_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "subscription plan {}",
                    request.subscription_plan_id
                ))
            })?;

        if let Some(existing) = self.repo.get_active_subscription(account.id).await? {
            tracing::info!(
                account_id = %account.id,
                subscription_id = %existing.external_subscription_id,
                "Subscription checkout refused - already subscribed"
            );
            return Err(BillingError::Validation(
                "account already has an active subscription".to_string(),
            ));
        }

        let metadata = HashMap::from([
            (
                METADATA_TYPE.to_string(),
                METADATA_TYPE_SUBSCRIPTION.to_string(),
            ),
            (METADATA_ACCOUNT_ID.to_string(), account.id.to_string()),
            (METADATA_PLAN_ID.to_string(), plan.id.to_string()),
        ]);

        let session = self
            .provider
            .create_checkout_session(CheckoutSessionRequest {
                mode: CheckoutMode::Subscription,
                price_id: plan.external_price_id.clone(),
                success_url: request.success_url,
                cancel_url: request.cancel_url,
                metadata,
                customer_id: account.external_customer_id.clone(),
            })
            .await?;

        tracing::info!(
            account_id = %account.id,
            plan = %plan.name,
            session_id = %session.session_id,
            "Subscription checkout created"
        );

        Ok(CheckoutResponse {
            session_id: session.session_id,
            url: session.url,
        })
    }

    async fn load_account(&self, account_id: Uuid) -> BillingResult<Account> {
        self.repo
            .get_account(account_id)
            .await?
            .ok_or(BillingError::AccountLookup(account_id))
    }
}

fn validate_urls(success_url: &str, cancel_url: &str) -> BillingResult<()> {
    if success_url.trim().is_empty() || cancel_url.trim().is_empty() {
        return Err(BillingError::Validation(
            "success and cancel urls are required".to_string(),
        ));
    }
    Ok(())
}
