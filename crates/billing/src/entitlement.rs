//! Listing-creation entitlement
//!
//! Quota comes from the account type and its live subscription:
//!
//! | Account                  | Subscription | Max listings        |
//! |--------------------------|--------------|---------------------|
//! | professional             | none         | 0 (subscription required) |
//! | individual/pending/admin | none         | 5 (free tier)       |
//! | any                      | live         | `plan.max_listings` (null = unlimited) |
//!
//! ## Failure policy
//!
//! [`EntitlementService::resolve_quota`] surfaces errors. Listing creation
//! goes through [`EntitlementService::check_can_create`], which never errors
//! and applies one rule: deny on failure, except that a non-professional
//! account whose type is known falls back to the free tier when the count
//! or subscription lookup fails. A known listing count is still held to the
//! free-tier limit. Paid entitlement is never granted on a failed read.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use marketplace_shared::{Account, AccountType, Repository};

use crate::error::{BillingError, BillingResult};

/// Listing limit for accounts without a subscription (other than professional)
pub const FREE_TIER_MAX_LISTINGS: i64 = 5;

pub const REASON_SUBSCRIPTION_REQUIRED: &str = "subscription required";
pub const REASON_ACCOUNT_NOT_FOUND: &str = "account not found";
pub const REASON_CHECK_UNAVAILABLE: &str = "entitlement check unavailable, please retry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub can_create: bool,
    pub active_listings: i64,
    /// `None` means unlimited
    pub max_listings: Option<i64>,
    /// Set only when `can_create` is false
    pub reason: Option<String>,
    /// True when the answer came from the failure policy rather than a full read
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl Quota {
    fn limited(active_listings: i64, max_listings: i64) -> Self {
        let can_create = active_listings < max_listings;
        Self {
            can_create,
            active_listings,
            max_listings: Some(max_listings),
            reason: (!can_create).then(|| {
                format!(
                    "listing limit reached ({} of {})",
                    active_listings, max_listings
                )
            }),
            degraded: false,
        }
    }

    fn unlimited(active_listings: i64) -> Self {
        Self {
            can_create: true,
            active_listings,
            max_listings: None,
            reason: None,
            degraded: false,
        }
    }

    fn denied(active_listings: i64, max_listings: Option<i64>, reason: &str) -> Self {
        Self {
            can_create: false,
            active_listings,
            max_listings,
            reason: Some(reason.to_string()),
            degraded: false,
        }
    }
}

/// Resolves listing quotas. Read-only: never creates or repairs subscriptions.
#[derive(Clone)]
pub struct EntitlementService {
    repo: Arc<dyn Repository>,
}

impl EntitlementService {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Compute the account's quota, surfacing any lookup failure
    pub async fn resolve_quota(&self, account_id: Uuid) -> BillingResult<Quota> {
        let account = self.load_account(account_id).await?;
        let active_listings = self.repo.count_quota_listings(account.id).await?;
        self.quota_for(&account, active_listings).await
    }

    /// Quota for listing creation. Failures become denials (or a degraded
    /// free-tier allowance) with a human-readable reason.
    pub async fn check_can_create(&self, account_id: Uuid) -> Quota {
        let account = match self.load_account(account_id).await {
            Ok(account) => account,
            Err(BillingError::AccountLookup(_)) => {
                tracing::info!(account_id = %account_id, "Quota check for unknown account");
                return Quota::denied(0, Some(0), REASON_ACCOUNT_NOT_FOUND);
            }
            Err(e) => {
                tracing::error!(
                    account_id = %account_id,
                    error = %e,
                    "Quota check failed loading account - denying"
                );
                return Quota {
                    degraded: true,
                    ..Quota::denied(0, None, REASON_CHECK_UNAVAILABLE)
                };
            }
        };

        let active_listings = match self.repo.count_quota_listings(account.id).await {
            Ok(count) => count,
            Err(e) => return degraded_quota(&account, None, &BillingError::from(e)),
        };

        match self.quota_for(&account, active_listings).await {
            Ok(quota) => quota,
            Err(e) => degraded_quota(&account, Some(active_listings), &e),
        }
    }

    async fn load_account(&self, account_id: Uuid) -> BillingResult<Account> {
        self.repo
            .get_account(account_id)
            .await?
            .ok_or(BillingError::AccountLookup(account_id))
    }

    async fn quota_for(&self, account: &Account, active_listings: i64) -> BillingResult<Quota> {
        let subscription = self.repo.get_active_subscription(account.id).await?;

        let Some(subscription) = subscription else {
            return Ok(match account.account_type {
                AccountType::Professional => {
                    Quota::denied(active_listings, Some(0), REASON_SUBSCRIPTION_REQUIRED)
                }
                AccountType::Individual | AccountType::Pending | AccountType::Admin => {
                    Quota::limited(active_listings, FREE_TIER_MAX_LISTINGS)
                }
            });
        };

        let plan = self
            .repo
            .get_subscription_plan(subscription.plan_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "subscription plan {} for subscription {}",
                    subscription.plan_id, subscription.id
                ))
            })?;

        Ok(match plan.max_listings {
            None => Quota::unlimited(active_listings),
            Some(max) => Quota::limited(active_listings, max),
        })
    }
}

/// Failure policy once the account is known. `active_listings` is `None`
/// when the count itself could not be read.
fn degraded_quota(account: &Account, active_listings: Option<i64>, error: &BillingError) -> Quota {
    if account.account_type == AccountType::Professional {
        tracing::error!(
            account_id = %account.id,
            error = %error,
            "Quota check failed for professional account - denying"
        );
        return Quota {
            degraded: true,
            ..Quota::denied(active_listings.unwrap_or(0), None, REASON_CHECK_UNAVAILABLE)
        };
    }

    tracing::warn!(
        account_id = %account.id,
        account_type = %account.account_type,
        active_listings = ?active_listings,
        error = %error,
        "Quota check failed - falling back to the free tier"
    );
    match active_listings {
        Some(count) => Quota {
            degraded: true,
            ..Quota::limited(count, FREE_TIER_MAX_LISTINGS)
        },
        None => Quota {
            can_create: true,
            active_listings: 0,
            max_listings: Some(FREE_TIER_MAX_LISTINGS),
            reason: None,
            degraded: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limited_quota_sets_reason_only_when_denied() {
        let open = Quota::limited(4, 5);
        assert!(open.can_create);
        assert_eq!(open.reason, None);

        let full = Quota::limited(5, 5);
        assert!(!full.can_create);
        assert_eq!(full.reason.as_deref(), Some("listing limit reached (5 of 5)"));
    }

    #[test]
    fn test_quota_serializes_camel_case() {
        let json = serde_json::to_value(Quota::unlimited(500)).unwrap();
        assert_eq!(json["canCreate"], true);
        assert_eq!(json["activeListings"], 500);
        assert!(json["maxListings"].is_null());
        assert!(json.get("degraded").is_none());
    }
}
