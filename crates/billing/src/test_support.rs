//! Shared fixtures for billing tests: a fake Stripe, a store that can be made
//! to fail, and a harness wiring them into a `BillingService`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use marketplace_shared::{
    Account, AccountType, BoostActivation, BoostPlan, BoostWrite, InMemoryRepository,
    LedgerAction, LedgerEntry, Listing, NewLedgerEntry, Repository, StoreError, StoreResult,
    Subscription, SubscriptionPlan, SubscriptionUpsert, UpsertOutcome,
};

use crate::client::{
    CheckoutSessionRequest, CreatedCheckoutSession, PaymentProvider, WebhookVerifier,
};
use crate::error::{BillingError, BillingResult};
use crate::notifications::testing::{fast_policy, RecordingSink};
use crate::notifications::{Notification, NotificationDispatcher};
use crate::payload::WebhookEvent;
use crate::webhooks::WebhookResponse;
use crate::BillingService;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// In-process stand-in for Stripe. Signs payloads with the real verifier.
pub struct FakeProvider {
    verifier: WebhookVerifier,
    next_session: AtomicUsize,
    pub sessions: Mutex<Vec<CheckoutSessionRequest>>,
    pub customer_emails: Mutex<HashMap<String, String>>,
    pub email_lookups: AtomicUsize,
    pub fail_checkout: AtomicBool,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            verifier: WebhookVerifier::new(WEBHOOK_SECRET, 300),
            next_session: AtomicUsize::new(1),
            sessions: Mutex::new(Vec::new()),
            customer_emails: Mutex::new(HashMap::new()),
            email_lookups: AtomicUsize::new(0),
            fail_checkout: AtomicBool::new(false),
        }
    }
}

impl FakeProvider {
    pub fn sign(&self, payload: &str) -> String {
        self.verifier
            .sign(payload, OffsetDateTime::now_utc().unix_timestamp())
            .unwrap()
    }

    pub async fn set_customer_email(&self, customer_id: &str, email: &str) {
        self.customer_emails
            .lock()
            .await
            .insert(customer_id.to_string(), email.to_string());
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<CreatedCheckoutSession> {
        if self.fail_checkout.load(Ordering::SeqCst) {
            return Err(BillingError::StripeApi("stripe is down".to_string()));
        }
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        let session_id = format!("cs_test_{}", n);
        self.sessions.lock().await.push(request);
        Ok(CreatedCheckoutSession {
            url: format!("https://checkout.stripe.test/{}", session_id),
            session_id,
        })
    }

    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>> {
        self.email_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.customer_emails.lock().await.get(customer_id).cloned())
    }

    fn verify_webhook(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verifier.verify(payload, signature)
    }
}

/// Delegates to an in-memory store; selected reads can be switched to fail
#[derive(Default)]
pub struct FlakyRepository {
    pub inner: InMemoryRepository,
    pub fail_accounts: AtomicBool,
    pub fail_listings: AtomicBool,
    pub fail_subscriptions: AtomicBool,
}

impl FlakyRepository {
    fn check(flag: &AtomicBool) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<Account>> {
        Self::check(&self.fail_accounts)?;
        self.inner.get_account(account_id).await
    }

    async fn find_account_by_customer_id(
        &self,
        customer_id: &str,
    ) -> StoreResult<Option<Account>> {
        Self::check(&self.fail_accounts)?;
        self.inner.find_account_by_customer_id(customer_id).await
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        Self::check(&self.fail_accounts)?;
        self.inner.find_account_by_email(email).await
    }

    async fn link_customer_id(&self, account_id: Uuid, customer_id: &str) -> StoreResult<()> {
        self.inner.link_customer_id(account_id, customer_id).await
    }

    async fn count_quota_listings(&self, owner_id: Uuid) -> StoreResult<i64> {
        Self::check(&self.fail_listings)?;
        self.inner.count_quota_listings(owner_id).await
    }

    async fn get_listing(&self, listing_id: Uuid) -> StoreResult<Option<Listing>> {
        Self::check(&self.fail_listings)?;
        self.inner.get_listing(listing_id).await
    }

    async fn get_active_subscription(
        &self,
        account_id: Uuid,
    ) -> StoreResult<Option<Subscription>> {
        Self::check(&self.fail_subscriptions)?;
        self.inner.get_active_subscription(account_id).await
    }

    async fn get_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        Self::check(&self.fail_subscriptions)?;
        self.inner
            .get_subscription_by_external_id(external_subscription_id)
            .await
    }

    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> StoreResult<UpsertOutcome> {
        Self::check(&self.fail_subscriptions)?;
        self.inner.upsert_subscription(upsert).await
    }

    async fn get_subscription_plan(&self, plan_id: Uuid) -> StoreResult<Option<SubscriptionPlan>> {
        self.inner.get_subscription_plan(plan_id).await
    }

    async fn find_subscription_plan_by_price(
        &self,
        external_price_id: &str,
    ) -> StoreResult<Option<SubscriptionPlan>> {
        self.inner
            .find_subscription_plan_by_price(external_price_id)
            .await
    }

    async fn get_boost_plan(&self, plan_id: Uuid) -> StoreResult<Option<BoostPlan>> {
        self.inner.get_boost_plan(plan_id).await
    }

    async fn insert_ledger_entry(&self, entry: NewLedgerEntry) -> StoreResult<LedgerEntry> {
        self.inner.insert_ledger_entry(entry).await
    }

    async fn get_ledger_entry(
        &self,
        external_session_id: &str,
        action: LedgerAction,
    ) -> StoreResult<Option<LedgerEntry>> {
        self.inner
            .get_ledger_entry(external_session_id, action)
            .await
    }

    async fn apply_boost_activation(&self, activation: BoostActivation) -> StoreResult<BoostWrite> {
        Self::check(&self.fail_listings)?;
        self.inner.apply_boost_activation(activation).await
    }

    async fn has_processed_event(&self, external_event_id: &str) -> StoreResult<bool> {
        self.inner.has_processed_event(external_event_id).await
    }

    async fn insert_processed_event(
        &self,
        external_event_id: &str,
        event_type: &str,
    ) -> StoreResult<()> {
        self.inner
            .insert_processed_event(external_event_id, event_type)
            .await
    }
}

/// A billing service over the in-memory store and the fake provider
pub struct Harness {
    pub repo: Arc<InMemoryRepository>,
    pub provider: Arc<FakeProvider>,
    pub sink: Arc<RecordingSink>,
    pub billing: BillingService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_horizon(None)
    }

    pub fn with_horizon(max_horizon_days: Option<i64>) -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        let provider = Arc::new(FakeProvider::default());
        let sink = Arc::new(RecordingSink::default());
        let notifier = NotificationDispatcher::with_policy(sink.clone(), fast_policy(3));
        let billing = BillingService::with_parts(
            repo.clone(),
            provider.clone(),
            notifier,
            max_horizon_days,
        );
        Self {
            repo,
            provider,
            sink,
            billing,
        }
    }

    pub async fn account(&self, account_type: AccountType) -> Account {
        let account = Account::new(
            account_type,
            format!("{}@example.com", Uuid::new_v4().simple()),
        );
        self.repo.insert_account(account.clone()).await;
        account
    }

    pub async fn listings(&self, owner: &Account, count: usize) -> Vec<Listing> {
        let mut listings = Vec::with_capacity(count);
        for _ in 0..count {
            let listing = Listing::new(owner.id);
            self.repo.insert_listing(listing.clone()).await;
            listings.push(listing);
        }
        listings
    }

    pub async fn boost_plan(&self, duration_days: i64, price_cents: i64) -> BoostPlan {
        let plan = BoostPlan::new(
            format!("{} day boost", duration_days),
            duration_days,
            price_cents,
            format!("price_boost_{}d", duration_days),
        );
        self.repo.insert_boost_plan(plan.clone()).await;
        plan
    }

    pub async fn subscription_plan(&self, max_listings: Option<i64>, price_id: &str) -> SubscriptionPlan {
        let plan = SubscriptionPlan::new(format!("plan {}", price_id), max_listings, price_id);
        self.repo.insert_subscription_plan(plan.clone()).await;
        plan
    }

    /// Sign and deliver a payload through the webhook handler
    pub async fn deliver(&self, payload: &str) -> WebhookResponse {
        let signature = self.provider.sign(payload);
        self.billing.webhooks.handle_event(payload, &signature).await
    }

    /// Let spawned notification tasks run to completion
    pub async fn notifications(&self) -> Vec<Notification> {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.sink.delivered().await
    }
}

pub fn event_payload(event_id: &str, event_type: &str, created: i64, object: Value) -> String {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": created,
        "livemode": false,
        "data": { "object": object }
    })
    .to_string()
}

/// `checkout.session.completed` for a boost purchase
pub fn boost_checkout_completed(
    event_id: &str,
    session_id: &str,
    listing_id: Uuid,
    plan_id: Uuid,
    payment_status: &str,
) -> String {
    event_payload(
        event_id,
        "checkout.session.completed",
        OffsetDateTime::now_utc().unix_timestamp(),
        json!({
            "id": session_id,
            "object": "checkout.session",
            "mode": "payment",
            "payment_status": payment_status,
            "metadata": {
                "type": "boost",
                "listingId": listing_id.to_string(),
                "planId": plan_id.to_string(),
            }
        }),
    )
}

/// A `customer.subscription.*` event
#[allow(clippy::too_many_arguments)]
pub fn subscription_event(
    event_id: &str,
    event_type: &str,
    created: i64,
    subscription_id: &str,
    customer: Value,
    status: &str,
    price_id: &str,
    metadata: Value,
) -> String {
    event_payload(
        event_id,
        event_type,
        created,
        json!({
            "id": subscription_id,
            "object": "subscription",
            "customer": customer,
            "status": status,
            "cancel_at_period_end": false,
            "current_period_start": created,
            "current_period_end": created + 30 * 24 * 3600,
            "metadata": metadata,
            "items": { "data": [{ "price": { "id": price_id } }] }
        }),
    )
}
