//! Billing Invariants Module
//!
//! Runnable consistency checks over the PostgreSQL store. They can be run
//! after a webhook replay or on a schedule to confirm reconciliation left the
//! system in a valid state.
//!
//! Checks only read, never write.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Live subscriptions whose period ended longer ago than this are suspicious
const STALE_PERIOD_GRACE_DAYS: i32 = 3;
/// Purchases never activated after this long are reported
const ABANDONED_PURCHASE_HOURS: i32 = 24;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Account(s) affected
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlement or money is wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Likely a missed webhook, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Violations at or above `severity`
    pub fn count_at_least(&self, severity: ViolationSeverity) -> usize {
        self.violations
            .iter()
            .filter(|v| severity_rank(v.severity) <= severity_rank(severity))
            .count()
    }
}

fn severity_rank(severity: ViolationSeverity) -> u8 {
    match severity {
        ViolationSeverity::Critical => 0,
        ViolationSeverity::High => 1,
        ViolationSeverity::Medium => 2,
        ViolationSeverity::Low => 3,
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleLiveSubsRow {
    account_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanActivationRow {
    account_id: Uuid,
    listing_id: Uuid,
    external_session_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingWindowRow {
    account_id: Uuid,
    listing_id: Uuid,
    external_session_id: String,
    boosted_until: Option<OffsetDateTime>,
    activated_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleLiveSubRow {
    account_id: Uuid,
    external_subscription_id: String,
    status: String,
    current_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct AbandonedPurchaseRow {
    account_id: Uuid,
    listing_id: Uuid,
    external_session_id: String,
    created_at: OffsetDateTime,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: At most one active/trialing subscription per account
    ///
    /// The partial unique index should make this impossible; a hit means the
    /// index is missing or was bypassed.
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleLiveSubsRow> = sqlx::query_as(
            r#"
            SELECT account_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing')
            GROUP BY account_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_live_subscription".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account has {} live subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Every activation has a purchase for the same session
    async fn check_activation_without_purchase(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanActivationRow> = sqlx::query_as(
            r#"
            SELECT a.account_id, a.listing_id, a.external_session_id
            FROM boost_ledger a
            WHERE a.action = 'activated'
              AND NOT EXISTS (
                  SELECT 1 FROM boost_ledger p
                  WHERE p.external_session_id = a.external_session_id
                    AND p.action = 'purchased'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "activation_without_purchase".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Session '{}' was activated without a recorded purchase",
                    row.external_session_id
                ),
                context: serde_json::json!({
                    "listing_id": row.listing_id,
                    "session_id": row.external_session_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: An activated listing has a window reaching past the activation
    ///
    /// Windows only grow, so `boosted_until` can never fall behind an
    /// activation's own timestamp.
    async fn check_activated_listing_without_window(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingWindowRow> = sqlx::query_as(
            r#"
            SELECT
                a.account_id,
                a.listing_id,
                a.external_session_id,
                l.boosted_until,
                a.created_at as activated_at
            FROM boost_ledger a
            JOIN listings l ON l.id = a.listing_id
            WHERE a.action = 'activated'
              AND (l.boosted_until IS NULL OR l.boosted_until < a.created_at)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "activated_listing_without_window".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Listing {} was activated at {} but its boost window is {:?}",
                    row.listing_id, row.activated_at, row.boosted_until
                ),
                context: serde_json::json!({
                    "listing_id": row.listing_id,
                    "session_id": row.external_session_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Live subscriptions are inside (or just past) their period
    ///
    /// A live row long past its period end usually means a missed
    /// `customer.subscription.updated`/`deleted` delivery.
    async fn check_stale_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleLiveSubRow> = sqlx::query_as(
            r#"
            SELECT account_id, external_subscription_id, status, current_period_end
            FROM subscriptions
            WHERE status IN ('active', 'trialing')
              AND current_period_end < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(STALE_PERIOD_GRACE_DAYS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_live_subscription".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Subscription '{}' is {} but its period ended at {:?}",
                    row.external_subscription_id, row.status, row.current_period_end
                ),
                context: serde_json::json!({
                    "subscription_id": row.external_subscription_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: Purchases are eventually activated
    ///
    /// Usually an abandoned checkout; occasionally a lost payment webhook.
    async fn check_abandoned_purchase(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AbandonedPurchaseRow> = sqlx::query_as(
            r#"
            SELECT p.account_id, p.listing_id, p.external_session_id, p.created_at
            FROM boost_ledger p
            WHERE p.action = 'purchased'
              AND p.created_at < NOW() - make_interval(hours => $1)
              AND NOT EXISTS (
                  SELECT 1 FROM boost_ledger a
                  WHERE a.external_session_id = p.external_session_id
                    AND a.action = 'activated'
              )
            "#,
        )
        .bind(ABANDONED_PURCHASE_HOURS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "abandoned_purchase".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Session '{}' purchased at {} was never activated",
                    row.external_session_id, row.created_at
                ),
                context: serde_json::json!({
                    "listing_id": row.listing_id,
                    "session_id": row.external_session_id,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_live_subscription" => self.check_single_live_subscription().await,
            "activation_without_purchase" => self.check_activation_without_purchase().await,
            "activated_listing_without_window" => {
                self.check_activated_listing_without_window().await
            }
            "stale_live_subscription" => self.check_stale_live_subscription().await,
            "abandoned_purchase" => self.check_abandoned_purchase().await,
            other => Err(BillingError::Validation(format!(
                "unknown invariant check '{}'",
                other
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_live_subscription",
            "activation_without_purchase",
            "activated_listing_without_window",
            "stale_live_subscription",
            "abandoned_purchase",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            account_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_live_subscription"));
        assert!(checks.contains(&"activation_without_purchase"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::UNIX_EPOCH,
            5,
            vec![
                violation("abandoned_purchase", ViolationSeverity::Low),
                violation("abandoned_purchase", ViolationSeverity::Low),
                violation("single_live_subscription", ViolationSeverity::Critical),
            ],
        );

        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);
        assert_eq!(summary.count_at_least(ViolationSeverity::High), 1);
        assert_eq!(summary.count_at_least(ViolationSeverity::Low), 3);
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::UNIX_EPOCH, 5, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 5);
    }
}
