//! PostgreSQL repository
//!
//! Unique constraints from the migrations carry the idempotency guarantees.
//! Constraint names surface in [`StoreError::UniqueViolation`] so callers
//! can tell which guard fired.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::repository::{Repository, StoreError, StoreResult};
use crate::types::{
    Account, BoostActivation, BoostPlan, BoostWrite, LedgerAction, LedgerEntry, Listing,
    NewLedgerEntry, Subscription, SubscriptionPlan, SubscriptionUpsert, UnknownVariant,
    UpsertOutcome,
};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return StoreError::UniqueViolation(db.constraint().unwrap_or_default().to_string());
            }
        }
        match &e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

impl From<UnknownVariant> for StoreError {
    fn from(e: UnknownVariant) -> Self {
        StoreError::InvalidData(e.to_string())
    }
}

const ACCOUNT_COLUMNS: &str = "id, account_type, email, external_customer_id, created_at";
const LISTING_COLUMNS: &str =
    "id, owner_id, status, is_active, deleted_at, boosted_until, created_at";
const SUBSCRIPTION_COLUMNS: &str = "id, account_id, plan_id, status, current_period_start, \
    current_period_end, cancel_at_period_end, external_subscription_id, last_event_at, \
    created_at, updated_at";
const LEDGER_COLUMNS: &str =
    "id, listing_id, plan_id, account_id, external_session_id, action, amount_cents, created_at";

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    account_type: String,
    email: String,
    external_customer_id: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: row.id,
            account_type: row.account_type.parse()?,
            email: row.email,
            external_customer_id: row.external_customer_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ListingRow {
    id: Uuid,
    owner_id: Uuid,
    status: String,
    is_active: bool,
    deleted_at: Option<OffsetDateTime>,
    boosted_until: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<ListingRow> for Listing {
    type Error = StoreError;

    fn try_from(row: ListingRow) -> Result<Self, Self::Error> {
        Ok(Listing {
            id: row.id,
            owner_id: row.owner_id,
            status: row.status.parse()?,
            is_active: row.is_active,
            deleted_at: row.deleted_at,
            boosted_until: row.boosted_until,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    account_id: Uuid,
    plan_id: Uuid,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    external_subscription_id: String,
    last_event_at: OffsetDateTime,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            account_id: row.account_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            external_subscription_id: row.external_subscription_id,
            last_event_at: row.last_event_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Upsert result row; `inserted` is derived from `xmax = 0`
#[derive(Debug, sqlx::FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    subscription: SubscriptionRow,
    inserted: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionPlanRow {
    id: Uuid,
    name: String,
    max_listings: Option<i64>,
    external_price_id: String,
}

impl From<SubscriptionPlanRow> for SubscriptionPlan {
    fn from(row: SubscriptionPlanRow) -> Self {
        SubscriptionPlan {
            id: row.id,
            name: row.name,
            max_listings: row.max_listings,
            external_price_id: row.external_price_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BoostPlanRow {
    id: Uuid,
    name: String,
    duration_days: i64,
    price_cents: i64,
    external_price_id: String,
}

impl From<BoostPlanRow> for BoostPlan {
    fn from(row: BoostPlanRow) -> Self {
        BoostPlan {
            id: row.id,
            name: row.name,
            duration_days: row.duration_days,
            price_cents: row.price_cents,
            external_price_id: row.external_price_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    listing_id: Uuid,
    plan_id: Uuid,
    account_id: Uuid,
    external_session_id: String,
    action: String,
    amount_cents: i64,
    created_at: OffsetDateTime,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: row.id,
            listing_id: row.listing_id,
            plan_id: row.plan_id,
            account_id: row.account_id,
            external_session_id: row.external_session_id,
            action: row.action.parse()?,
            amount_cents: row.amount_cents,
            created_at: row.created_at,
        })
    }
}

/// Repository backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_account(&self, clause: &str, value: &str) -> StoreResult<Option<Account>> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("SELECT {} FROM accounts WHERE {}", ACCOUNT_COLUMNS, clause))
                .bind(value)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Account::try_from).transpose()
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<Account>> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS))
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Account::try_from).transpose()
    }

    async fn find_account_by_customer_id(
        &self,
        customer_id: &str,
    ) -> StoreResult<Option<Account>> {
        self.fetch_account("external_customer_id = $1", customer_id)
            .await
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        self.fetch_account("LOWER(email) = LOWER($1)", email).await
    }

    async fn link_customer_id(&self, account_id: Uuid, customer_id: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE accounts SET external_customer_id = $2 WHERE id = $1")
            .bind(account_id)
            .bind(customer_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("account {}", account_id)));
        }
        Ok(())
    }

    async fn count_quota_listings(&self, owner_id: Uuid) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM listings
            WHERE owner_id = $1
              AND is_active
              AND deleted_at IS NULL
              AND status IN ('draft', 'pending', 'approved')
            "#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get_listing(&self, listing_id: Uuid) -> StoreResult<Option<Listing>> {
        let row: Option<ListingRow> =
            sqlx::query_as(&format!("SELECT {} FROM listings WHERE id = $1", LISTING_COLUMNS))
                .bind(listing_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Listing::try_from).transpose()
    }

    async fn get_active_subscription(
        &self,
        account_id: Uuid,
    ) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE account_id = $1 AND status IN ('active', 'trialing')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn get_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE external_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> StoreResult<UpsertOutcome> {
        // The WHERE on the conflict branch drops events older than the stored
        // one; RETURNING then yields no row.
        let row: Option<UpsertRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                id, account_id, plan_id, status, current_period_start, current_period_end,
                cancel_at_period_end, external_subscription_id, last_event_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (external_subscription_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE subscriptions.last_event_at <= EXCLUDED.last_event_at
            RETURNING {}, (xmax = 0) AS inserted
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(upsert.account_id)
        .bind(upsert.plan_id)
        .bind(upsert.status.as_str())
        .bind(upsert.current_period_start)
        .bind(upsert.current_period_end)
        .bind(upsert.cancel_at_period_end)
        .bind(&upsert.external_subscription_id)
        .bind(upsert.event_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(UpsertRow {
                subscription,
                inserted: true,
            }) => Ok(UpsertOutcome::Inserted(subscription.try_into()?)),
            Some(UpsertRow { subscription, .. }) => {
                Ok(UpsertOutcome::Updated(subscription.try_into()?))
            }
            None => {
                let current = self
                    .get_subscription_by_external_id(&upsert.external_subscription_id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Backend(format!(
                            "subscription {} vanished during upsert",
                            upsert.external_subscription_id
                        ))
                    })?;
                Ok(UpsertOutcome::Stale(current))
            }
        }
    }

    async fn get_subscription_plan(
        &self,
        plan_id: Uuid,
    ) -> StoreResult<Option<SubscriptionPlan>> {
        let row: Option<SubscriptionPlanRow> = sqlx::query_as(
            "SELECT id, name, max_listings, external_price_id FROM subscription_plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionPlan::from))
    }

    async fn find_subscription_plan_by_price(
        &self,
        external_price_id: &str,
    ) -> StoreResult<Option<SubscriptionPlan>> {
        let row: Option<SubscriptionPlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, max_listings, external_price_id
            FROM subscription_plans WHERE external_price_id = $1
            "#,
        )
        .bind(external_price_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionPlan::from))
    }

    async fn get_boost_plan(&self, plan_id: Uuid) -> StoreResult<Option<BoostPlan>> {
        let row: Option<BoostPlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, duration_days, price_cents, external_price_id
            FROM boost_plans WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BoostPlan::from))
    }

    async fn insert_ledger_entry(&self, entry: NewLedgerEntry) -> StoreResult<LedgerEntry> {
        let row: LedgerRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO boost_ledger (
                id, listing_id, plan_id, account_id, external_session_id, action, amount_cents, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING {}
            "#,
            LEDGER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(entry.listing_id)
        .bind(entry.plan_id)
        .bind(entry.account_id)
        .bind(&entry.external_session_id)
        .bind(entry.action.as_str())
        .bind(entry.amount_cents)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_ledger_entry(
        &self,
        external_session_id: &str,
        action: LedgerAction,
    ) -> StoreResult<Option<LedgerEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM boost_ledger WHERE external_session_id = $1 AND action = $2",
            LEDGER_COLUMNS
        ))
        .bind(external_session_id)
        .bind(action.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    async fn apply_boost_activation(&self, activation: BoostActivation) -> StoreResult<BoostWrite> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE listings SET boosted_until = $2
            WHERE id = $1 AND boosted_until IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(activation.listing_id)
        .bind(activation.new_boosted_until)
        .bind(activation.expected_boosted_until)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS (SELECT 1 FROM listings WHERE id = $1)")
                    .bind(activation.listing_id)
                    .fetch_one(&self.pool)
                    .await?;
            if !exists {
                return Err(StoreError::NotFound(format!(
                    "listing {}",
                    activation.listing_id
                )));
            }
            return Ok(BoostWrite::WindowMoved);
        }

        // A concurrent insert for the same (session, action) blocks here until
        // the other transaction settles, then DO NOTHING yields no row.
        let entry = activation.entry;
        let inserted: Option<LedgerRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO boost_ledger (
                id, listing_id, plan_id, account_id, external_session_id, action, amount_cents, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT ON CONSTRAINT boost_ledger_session_action_key DO NOTHING
            RETURNING {}
            "#,
            LEDGER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(entry.listing_id)
        .bind(entry.plan_id)
        .bind(entry.account_id)
        .bind(&entry.external_session_id)
        .bind(entry.action.as_str())
        .bind(entry.amount_cents)
        .fetch_optional(&mut *tx)
        .await?;

        match inserted {
            Some(row) => {
                tx.commit().await?;
                Ok(BoostWrite::Applied(row.try_into()?))
            }
            None => {
                tx.rollback().await?;
                Ok(BoostWrite::AlreadyActivated)
            }
        }
    }

    async fn has_processed_event(&self, external_event_id: &str) -> StoreResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM processed_events WHERE external_event_id = $1)",
        )
        .bind(external_event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_processed_event(
        &self,
        external_event_id: &str,
        event_type: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (external_event_id, event_type, processed_at)
            VALUES ($1, $2, NOW())
            "#,
        )
        .bind(external_event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
