//! Boost ledger
//!
//! One-off boost purchases extend a listing's `boosted_until`. The ledger
//! holds one `purchased` row per checkout session (written at session
//! creation) and at most one `activated` row (written when the payment
//! webhook arrives). The (session, action) uniqueness is the idempotency key.
//!
//! Windows only grow: an activation extends from the later of now and the
//! current window end.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use marketplace_shared::{
    BoostActivation, BoostWrite, LedgerAction, LedgerEntry, NewLedgerEntry, Repository,
};

use crate::error::{BillingError, BillingResult};

/// Re-reads allowed when another activation moves the window concurrently
const MAX_ACTIVATION_ATTEMPTS: usize = 3;

const SECONDS_PER_DAY: i64 = 86_400;

/// `base` moved forward by `days`, or `None` outside the representable range
pub fn add_days(base: OffsetDateTime, days: i64) -> Option<OffsetDateTime> {
    days.checked_mul(SECONDS_PER_DAY)
        .and_then(|secs| base.checked_add(Duration::seconds(secs)))
}

/// New window end for a boost of `duration_days` applied at `now`.
/// `None` when the result would leave the supported date range.
pub fn extend_boost_window(
    current: Option<OffsetDateTime>,
    now: OffsetDateTime,
    duration_days: i64,
) -> Option<OffsetDateTime> {
    let baseline = match current {
        Some(until) if until > now => until,
        _ => now,
    };
    add_days(baseline, duration_days)
}

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub listing_id: Uuid,
    pub plan_id: Uuid,
    pub account_id: Uuid,
    pub external_session_id: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    Activated {
        listing_id: Uuid,
        account_id: Uuid,
        boosted_until: OffsetDateTime,
        entry: LedgerEntry,
    },
    /// The session was activated before; nothing changed
    AlreadyActivated,
}

#[derive(Clone)]
pub struct BoostLedger {
    repo: Arc<dyn Repository>,
}

impl BoostLedger {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Log a purchase at checkout-session creation.
    ///
    /// Returns [`BillingError::Conflict`] if the session already has a
    /// `purchased` row; callers retrying session creation treat that as success.
    pub async fn record_purchase(&self, request: PurchaseRequest) -> BillingResult<LedgerEntry> {
        if request.external_session_id.trim().is_empty() {
            return Err(BillingError::Validation(
                "external session id is required".to_string(),
            ));
        }
        if request.amount_cents < 0 {
            return Err(BillingError::Validation(format!(
                "amount must not be negative: {}",
                request.amount_cents
            )));
        }

        let session_id = request.external_session_id.clone();
        let result = self
            .repo
            .insert_ledger_entry(NewLedgerEntry {
                listing_id: request.listing_id,
                plan_id: request.plan_id,
                account_id: request.account_id,
                external_session_id: request.external_session_id,
                action: LedgerAction::Purchased,
                amount_cents: request.amount_cents,
            })
            .await;

        match result {
            Ok(entry) => {
                tracing::info!(
                    session_id = %session_id,
                    listing_id = %entry.listing_id,
                    amount_cents = entry.amount_cents,
                    "Boost purchase recorded"
                );
                Ok(entry)
            }
            Err(e) if e.is_unique_violation() => {
                tracing::info!(session_id = %session_id, "Boost purchase already recorded");
                Err(BillingError::Conflict(format!(
                    "purchase already recorded for session {}",
                    session_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply the boost bought in `external_session_id`, at most once
    pub async fn activate(&self, external_session_id: &str) -> BillingResult<ActivationOutcome> {
        self.activate_at(external_session_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn activate_at(
        &self,
        external_session_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<ActivationOutcome> {
        let purchase = self
            .repo
            .get_ledger_entry(external_session_id, LedgerAction::Purchased)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "no purchase recorded for session {}",
                    external_session_id
                ))
            })?;

        let plan = self
            .repo
            .get_boost_plan(purchase.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("boost plan {}", purchase.plan_id)))?;

        for attempt in 1..=MAX_ACTIVATION_ATTEMPTS {
            // Fast path; the ledger constraint below is the real guard
            if self
                .repo
                .get_ledger_entry(external_session_id, LedgerAction::Activated)
                .await?
                .is_some()
            {
                tracing::info!(
                    session_id = %external_session_id,
                    "Boost already activated - replay ignored"
                );
                return Ok(ActivationOutcome::AlreadyActivated);
            }

            let listing = self
                .repo
                .get_listing(purchase.listing_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("listing {}", purchase.listing_id)))?;

            if listing.deleted_at.is_some() {
                tracing::warn!(
                    session_id = %external_session_id,
                    listing_id = %listing.id,
                    "Activating boost for a deleted listing"
                );
            }

            let new_boosted_until =
                extend_boost_window(listing.boosted_until, now, plan.duration_days).ok_or_else(
                    || {
                        tracing::error!(
                            session_id = %external_session_id,
                            plan_id = %plan.id,
                            duration_days = plan.duration_days,
                            "Boost plan duration overflows the listing window"
                        );
                        BillingError::Internal(format!(
                            "boost plan {} duration of {} days is out of range",
                            plan.id, plan.duration_days
                        ))
                    },
                )?;

            let write = self
                .repo
                .apply_boost_activation(BoostActivation {
                    listing_id: listing.id,
                    expected_boosted_until: listing.boosted_until,
                    new_boosted_until,
                    entry: NewLedgerEntry {
                        listing_id: purchase.listing_id,
                        plan_id: purchase.plan_id,
                        account_id: purchase.account_id,
                        external_session_id: external_session_id.to_string(),
                        action: LedgerAction::Activated,
                        amount_cents: purchase.amount_cents,
                    },
                })
                .await?;

            match write {
                BoostWrite::Applied(entry) => {
                    tracing::info!(
                        session_id = %external_session_id,
                        listing_id = %listing.id,
                        duration_days = plan.duration_days,
                        previous_until = ?listing.boosted_until,
                        boosted_until = %new_boosted_until,
                        "Boost activated"
                    );
                    return Ok(ActivationOutcome::Activated {
                        listing_id: listing.id,
                        account_id: purchase.account_id,
                        boosted_until: new_boosted_until,
                        entry,
                    });
                }
                BoostWrite::AlreadyActivated => {
                    tracing::info!(
                        session_id = %external_session_id,
                        "Concurrent activation won the race - no-op"
                    );
                    return Ok(ActivationOutcome::AlreadyActivated);
                }
                BoostWrite::WindowMoved => {
                    tracing::warn!(
                        session_id = %external_session_id,
                        listing_id = %listing.id,
                        attempt = attempt,
                        "Boost window moved during activation - re-reading"
                    );
                }
            }
        }

        Err(BillingError::Transient(format!(
            "boost window for session {} kept changing",
            external_session_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[test]
    fn test_window_starts_now_when_never_boosted() {
        let now = at(1_700_000_000);
        assert_eq!(extend_boost_window(None, now, 3), Some(now + Duration::days(3)));
    }

    #[test]
    fn test_window_appends_to_active_boost() {
        let now = at(1_700_000_000);
        let current = now + Duration::days(2);
        assert_eq!(
            extend_boost_window(Some(current), now, 7),
            Some(current + Duration::days(7))
        );
    }

    #[test]
    fn test_expired_window_restarts_from_now() {
        let now = at(1_700_000_000);
        let expired = now - Duration::days(10);
        assert_eq!(
            extend_boost_window(Some(expired), now, 1),
            Some(now + Duration::days(1))
        );
    }

    #[test]
    fn test_out_of_range_durations_do_not_panic() {
        let now = at(1_700_000_000);
        assert_eq!(extend_boost_window(None, now, i64::MAX), None);
        assert_eq!(extend_boost_window(None, now, 100_000_000), None);
        assert_eq!(add_days(now, -i64::MAX), None);
    }
}
