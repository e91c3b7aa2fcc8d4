//! Storage interface consumed by the billing engine
//!
//! Every cross-request guarantee the engine relies on (single live
//! subscription per account, one `activated` ledger row per session, one
//! processed record per provider event) is enforced by the store through
//! unique constraints, never by a prior existence check in the caller.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{
    Account, BoostActivation, BoostPlan, BoostWrite, LedgerAction, LedgerEntry, Listing,
    NewLedgerEntry, Subscription, SubscriptionPlan, SubscriptionUpsert, UpsertOutcome,
};

/// Unique index allowing at most one active/trialing subscription per account
pub const LIVE_SUBSCRIPTION_CONSTRAINT: &str = "subscriptions_one_live_per_account";
/// Unique (external_session_id, action) on the boost ledger
pub const LEDGER_SESSION_ACTION_CONSTRAINT: &str = "boost_ledger_session_action_key";
/// Primary key of the processed webhook events table
pub const PROCESSED_EVENT_CONSTRAINT: &str = "processed_events_pkey";

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }

    /// True when the violated constraint is the named one
    pub fn violates(&self, constraint: &str) -> bool {
        matches!(self, StoreError::UniqueViolation(c) if c == constraint)
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    // Accounts

    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<Account>>;

    async fn find_account_by_customer_id(&self, customer_id: &str)
        -> StoreResult<Option<Account>>;

    /// Case-insensitive email lookup
    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>>;

    /// Record the provider customer id for an account
    async fn link_customer_id(&self, account_id: Uuid, customer_id: &str) -> StoreResult<()>;

    // Listings

    /// Count listings that are active, not deleted, and in draft/pending/approved
    async fn count_quota_listings(&self, owner_id: Uuid) -> StoreResult<i64>;

    async fn get_listing(&self, listing_id: Uuid) -> StoreResult<Option<Listing>>;

    // Subscriptions

    /// The account's active or trialing subscription, newest first if several
    async fn get_active_subscription(&self, account_id: Uuid)
        -> StoreResult<Option<Subscription>>;

    async fn get_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>>;

    /// Insert or update keyed by external subscription id. Updates carrying an
    /// `event_at` older than the stored `last_event_at` are not applied.
    ///
    /// Fails with [`StoreError::UniqueViolation`] naming
    /// [`LIVE_SUBSCRIPTION_CONSTRAINT`] when the write would give the account a
    /// second live subscription.
    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> StoreResult<UpsertOutcome>;

    async fn get_subscription_plan(&self, plan_id: Uuid) -> StoreResult<Option<SubscriptionPlan>>;

    async fn find_subscription_plan_by_price(
        &self,
        external_price_id: &str,
    ) -> StoreResult<Option<SubscriptionPlan>>;

    // Boost ledger

    async fn get_boost_plan(&self, plan_id: Uuid) -> StoreResult<Option<BoostPlan>>;

    /// Append a ledger row. Fails with [`StoreError::UniqueViolation`] naming
    /// [`LEDGER_SESSION_ACTION_CONSTRAINT`] on a duplicate (session, action).
    async fn insert_ledger_entry(&self, entry: NewLedgerEntry) -> StoreResult<LedgerEntry>;

    async fn get_ledger_entry(
        &self,
        external_session_id: &str,
        action: LedgerAction,
    ) -> StoreResult<Option<LedgerEntry>>;

    /// Update the listing's boost window and append the `activated` ledger row
    /// as one unit.
    ///
    /// The window is only written if it still equals
    /// `expected_boosted_until`. If the ledger insert hits the (session,
    /// action) constraint the window update is discarded as well.
    async fn apply_boost_activation(&self, activation: BoostActivation) -> StoreResult<BoostWrite>;

    // Webhook dedup

    async fn has_processed_event(&self, external_event_id: &str) -> StoreResult<bool>;

    /// Fails with [`StoreError::UniqueViolation`] if the event was already recorded
    async fn insert_processed_event(
        &self,
        external_event_id: &str,
        event_type: &str,
    ) -> StoreResult<()>;
}
