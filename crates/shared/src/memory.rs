//! In-memory repository
//!
//! Enforces the same unique constraints as the PostgreSQL schema so the
//! engine's idempotency behaviour can be exercised without a database.
//! Every successful write bumps a mutation counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::repository::{
    Repository, StoreError, StoreResult, LEDGER_SESSION_ACTION_CONSTRAINT,
    LIVE_SUBSCRIPTION_CONSTRAINT, PROCESSED_EVENT_CONSTRAINT,
};
use crate::types::{
    Account, BoostActivation, BoostPlan, BoostWrite, LedgerAction, LedgerEntry, Listing,
    NewLedgerEntry, ProcessedEvent, Subscription, SubscriptionPlan, SubscriptionUpsert,
    UpsertOutcome,
};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    listings: HashMap<Uuid, Listing>,
    subscription_plans: HashMap<Uuid, SubscriptionPlan>,
    subscriptions: HashMap<Uuid, Subscription>,
    boost_plans: HashMap<Uuid, BoostPlan>,
    ledger: Vec<LedgerEntry>,
    processed_events: HashMap<String, ProcessedEvent>,
}

impl MemoryState {
    fn ledger_entry(&self, session_id: &str, action: LedgerAction) -> Option<&LedgerEntry> {
        self.ledger
            .iter()
            .find(|e| e.external_session_id == session_id && e.action == action)
    }

    /// Another live subscription for the same account, excluding `except`
    fn conflicting_live_subscription(&self, account_id: Uuid, except: Option<Uuid>) -> bool {
        self.subscriptions.values().any(|s| {
            s.account_id == account_id && s.status.is_live() && Some(s.id) != except
        })
    }
}

#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<MemoryState>,
    mutations: AtomicU64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes since construction, fixtures included
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    // Fixture helpers. Listing and account lifecycle belong to other
    // services; these exist to seed state.

    pub async fn insert_account(&self, account: Account) {
        self.state.write().await.accounts.insert(account.id, account);
        self.bump();
    }

    pub async fn insert_listing(&self, listing: Listing) {
        self.state.write().await.listings.insert(listing.id, listing);
        self.bump();
    }

    pub async fn insert_subscription_plan(&self, plan: SubscriptionPlan) {
        self.state
            .write()
            .await
            .subscription_plans
            .insert(plan.id, plan);
        self.bump();
    }

    pub async fn insert_boost_plan(&self, plan: BoostPlan) {
        self.state.write().await.boost_plans.insert(plan.id, plan);
        self.bump();
    }

    /// Insert a subscription row directly, honouring the live-subscription constraint
    pub async fn insert_subscription(&self, subscription: Subscription) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if subscription.status.is_live()
            && state.conflicting_live_subscription(subscription.account_id, None)
        {
            return Err(StoreError::UniqueViolation(
                LIVE_SUBSCRIPTION_CONSTRAINT.to_string(),
            ));
        }
        state.subscriptions.insert(subscription.id, subscription);
        self.bump();
        Ok(())
    }

    pub async fn soft_delete_listing(&self, listing_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let listing = state
            .listings
            .get_mut(&listing_id)
            .ok_or_else(|| StoreError::NotFound(format!("listing {}", listing_id)))?;
        listing.deleted_at = Some(OffsetDateTime::now_utc());
        self.bump();
        Ok(())
    }

    pub async fn set_boosted_until(
        &self,
        listing_id: Uuid,
        boosted_until: Option<OffsetDateTime>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let listing = state
            .listings
            .get_mut(&listing_id)
            .ok_or_else(|| StoreError::NotFound(format!("listing {}", listing_id)))?;
        listing.boosted_until = boosted_until;
        self.bump();
        Ok(())
    }

    pub async fn ledger_entries(&self, external_session_id: &str) -> Vec<LedgerEntry> {
        self.state
            .read()
            .await
            .ledger
            .iter()
            .filter(|e| e.external_session_id == external_session_id)
            .cloned()
            .collect()
    }

    pub async fn subscriptions_for(&self, account_id: Uuid) -> Vec<Subscription> {
        self.state
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.state.read().await.accounts.get(&account_id).cloned())
    }

    async fn find_account_by_customer_id(
        &self,
        customer_id: &str,
    ) -> StoreResult<Option<Account>> {
        Ok(self
            .state
            .read()
            .await
            .accounts
            .values()
            .find(|a| a.external_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        Ok(self
            .state
            .read()
            .await
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn link_customer_id(&self, account_id: Uuid, customer_id: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.accounts.values().any(|a| {
            a.id != account_id && a.external_customer_id.as_deref() == Some(customer_id)
        }) {
            return Err(StoreError::UniqueViolation(
                "accounts_external_customer_id_key".to_string(),
            ));
        }
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", account_id)))?;
        account.external_customer_id = Some(customer_id.to_string());
        self.bump();
        Ok(())
    }

    async fn count_quota_listings(&self, owner_id: Uuid) -> StoreResult<i64> {
        let count = self
            .state
            .read()
            .await
            .listings
            .values()
            .filter(|l| l.owner_id == owner_id && l.consumes_quota())
            .count();
        Ok(count as i64)
    }

    async fn get_listing(&self, listing_id: Uuid) -> StoreResult<Option<Listing>> {
        Ok(self.state.read().await.listings.get(&listing_id).cloned())
    }

    async fn get_active_subscription(
        &self,
        account_id: Uuid,
    ) -> StoreResult<Option<Subscription>> {
        Ok(self
            .state
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| s.account_id == account_id && s.status.is_live())
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn get_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        Ok(self
            .state
            .read()
            .await
            .subscriptions
            .values()
            .find(|s| s.external_subscription_id == external_subscription_id)
            .cloned())
    }

    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> StoreResult<UpsertOutcome> {
        let mut state = self.state.write().await;
        let now = OffsetDateTime::now_utc();

        let existing = state
            .subscriptions
            .values()
            .find(|s| s.external_subscription_id == upsert.external_subscription_id)
            .cloned();

        match existing {
            Some(current) => {
                if current.last_event_at > upsert.event_at {
                    return Ok(UpsertOutcome::Stale(current));
                }
                if upsert.status.is_live()
                    && state.conflicting_live_subscription(current.account_id, Some(current.id))
                {
                    return Err(StoreError::UniqueViolation(
                        LIVE_SUBSCRIPTION_CONSTRAINT.to_string(),
                    ));
                }
                let updated = Subscription {
                    plan_id: upsert.plan_id,
                    status: upsert.status,
                    current_period_start: upsert.current_period_start,
                    current_period_end: upsert.current_period_end,
                    cancel_at_period_end: upsert.cancel_at_period_end,
                    last_event_at: upsert.event_at,
                    updated_at: now,
                    ..current
                };
                state.subscriptions.insert(updated.id, updated.clone());
                self.bump();
                Ok(UpsertOutcome::Updated(updated))
            }
            None => {
                if upsert.status.is_live()
                    && state.conflicting_live_subscription(upsert.account_id, None)
                {
                    return Err(StoreError::UniqueViolation(
                        LIVE_SUBSCRIPTION_CONSTRAINT.to_string(),
                    ));
                }
                let inserted = Subscription {
                    id: Uuid::new_v4(),
                    account_id: upsert.account_id,
                    plan_id: upsert.plan_id,
                    status: upsert.status,
                    current_period_start: upsert.current_period_start,
                    current_period_end: upsert.current_period_end,
                    cancel_at_period_end: upsert.cancel_at_period_end,
                    external_subscription_id: upsert.external_subscription_id,
                    last_event_at: upsert.event_at,
                    created_at: now,
                    updated_at: now,
                };
                state.subscriptions.insert(inserted.id, inserted.clone());
                self.bump();
                Ok(UpsertOutcome::Inserted(inserted))
            }
        }
    }

    async fn get_subscription_plan(
        &self,
        plan_id: Uuid,
    ) -> StoreResult<Option<SubscriptionPlan>> {
        Ok(self
            .state
            .read()
            .await
            .subscription_plans
            .get(&plan_id)
            .cloned())
    }

    async fn find_subscription_plan_by_price(
        &self,
        external_price_id: &str,
    ) -> StoreResult<Option<SubscriptionPlan>> {
        Ok(self
            .state
            .read()
            .await
            .subscription_plans
            .values()
            .find(|p| p.external_price_id == external_price_id)
            .cloned())
    }

    async fn get_boost_plan(&self, plan_id: Uuid) -> StoreResult<Option<BoostPlan>> {
        Ok(self.state.read().await.boost_plans.get(&plan_id).cloned())
    }

    async fn insert_ledger_entry(&self, entry: NewLedgerEntry) -> StoreResult<LedgerEntry> {
        let mut state = self.state.write().await;
        if state
            .ledger_entry(&entry.external_session_id, entry.action)
            .is_some()
        {
            return Err(StoreError::UniqueViolation(
                LEDGER_SESSION_ACTION_CONSTRAINT.to_string(),
            ));
        }
        let row = entry.into_entry(OffsetDateTime::now_utc());
        state.ledger.push(row.clone());
        self.bump();
        Ok(row)
    }

    async fn get_ledger_entry(
        &self,
        external_session_id: &str,
        action: LedgerAction,
    ) -> StoreResult<Option<LedgerEntry>> {
        Ok(self
            .state
            .read()
            .await
            .ledger_entry(external_session_id, action)
            .cloned())
    }

    async fn apply_boost_activation(&self, activation: BoostActivation) -> StoreResult<BoostWrite> {
        let mut state = self.state.write().await;

        let current = state
            .listings
            .get(&activation.listing_id)
            .ok_or_else(|| StoreError::NotFound(format!("listing {}", activation.listing_id)))?
            .boosted_until;
        if current != activation.expected_boosted_until {
            return Ok(BoostWrite::WindowMoved);
        }
        if state
            .ledger_entry(&activation.entry.external_session_id, activation.entry.action)
            .is_some()
        {
            return Ok(BoostWrite::AlreadyActivated);
        }

        if let Some(listing) = state.listings.get_mut(&activation.listing_id) {
            listing.boosted_until = Some(activation.new_boosted_until);
        }
        let row = activation.entry.into_entry(OffsetDateTime::now_utc());
        state.ledger.push(row.clone());
        self.bump();
        Ok(BoostWrite::Applied(row))
    }

    async fn has_processed_event(&self, external_event_id: &str) -> StoreResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .processed_events
            .contains_key(external_event_id))
    }

    async fn insert_processed_event(
        &self,
        external_event_id: &str,
        event_type: &str,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.processed_events.contains_key(external_event_id) {
            return Err(StoreError::UniqueViolation(
                PROCESSED_EVENT_CONSTRAINT.to_string(),
            ));
        }
        state.processed_events.insert(
            external_event_id.to_string(),
            ProcessedEvent {
                external_event_id: external_event_id.to_string(),
                event_type: event_type.to_string(),
                processed_at: OffsetDateTime::now_utc(),
            },
        );
        self.bump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::{AccountType, SubscriptionStatus};

    fn upsert(account_id: Uuid, plan_id: Uuid, external_id: &str) -> SubscriptionUpsert {
        SubscriptionUpsert {
            account_id,
            plan_id,
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            external_subscription_id: external_id.to_string(),
            event_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_ledger_rejects_duplicate_session_action() {
        let repo = InMemoryRepository::new();
        let entry = NewLedgerEntry {
            listing_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            external_session_id: "cs_1".to_string(),
            action: LedgerAction::Purchased,
            amount_cents: 500,
        };

        repo.insert_ledger_entry(entry.clone()).await.unwrap();
        let err = repo.insert_ledger_entry(entry.clone()).await.unwrap_err();
        assert!(err.violates(LEDGER_SESSION_ACTION_CONSTRAINT));

        // Same session, different action is a separate key
        let activated = NewLedgerEntry {
            action: LedgerAction::Activated,
            ..entry
        };
        repo.insert_ledger_entry(activated).await.unwrap();
        assert_eq!(repo.ledger_entries("cs_1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_second_live_subscription_is_rejected() {
        let repo = InMemoryRepository::new();
        let account = Account::new(AccountType::Professional, "pro@example.com");
        let plan_id = Uuid::new_v4();

        repo.upsert_subscription(upsert(account.id, plan_id, "sub_1"))
            .await
            .unwrap();
        let err = repo
            .upsert_subscription(upsert(account.id, plan_id, "sub_2"))
            .await
            .unwrap_err();
        assert!(err.violates(LIVE_SUBSCRIPTION_CONSTRAINT));
    }

    #[tokio::test]
    async fn test_older_event_does_not_overwrite_newer_state() {
        let repo = InMemoryRepository::new();
        let account_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let mut newer = upsert(account_id, plan_id, "sub_1");
        newer.status = SubscriptionStatus::Expired;
        newer.event_at = now;
        repo.upsert_subscription(newer).await.unwrap();

        let mut older = upsert(account_id, plan_id, "sub_1");
        older.event_at = now - time::Duration::minutes(5);
        let outcome = repo.upsert_subscription(older).await.unwrap();

        assert!(outcome.is_stale());
        assert_eq!(outcome.subscription().status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn test_boost_activation_guards_window_and_session() {
        let repo = InMemoryRepository::new();
        let listing = Listing::new(Uuid::new_v4());
        repo.insert_listing(listing.clone()).await;
        let target = OffsetDateTime::now_utc() + time::Duration::days(3);

        let activation = BoostActivation {
            listing_id: listing.id,
            expected_boosted_until: None,
            new_boosted_until: target,
            entry: NewLedgerEntry {
                listing_id: listing.id,
                plan_id: Uuid::new_v4(),
                account_id: listing.owner_id,
                external_session_id: "cs_1".to_string(),
                action: LedgerAction::Activated,
                amount_cents: 0,
            },
        };

        let first = repo.apply_boost_activation(activation.clone()).await.unwrap();
        assert!(matches!(first, BoostWrite::Applied(_)));

        // Stale expectation: the window moved
        let moved = repo.apply_boost_activation(activation.clone()).await.unwrap();
        assert_eq!(moved, BoostWrite::WindowMoved);

        // Fresh expectation but the session is already activated
        let replay = BoostActivation {
            expected_boosted_until: Some(target),
            new_boosted_until: target + time::Duration::days(3),
            ..activation
        };
        let again = repo.apply_boost_activation(replay).await.unwrap();
        assert_eq!(again, BoostWrite::AlreadyActivated);

        let stored = repo.get_listing(listing.id).await.unwrap().unwrap();
        assert_eq!(stored.boosted_until, Some(target));
    }
}
