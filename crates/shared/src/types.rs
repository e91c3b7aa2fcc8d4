//! Domain types shared between the billing engine and its storage backends

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Error returned when a stored enum value cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Generates `as_str`, `Display` and `FromStr` for a snake_case string enum.
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Account type, which determines the default entitlement tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Individual,
    Professional,
    Pending,
    Admin,
}

string_enum!(AccountType, "account type", {
    Individual => "individual",
    Professional => "professional",
    Pending => "pending",
    Admin => "admin",
});

/// Internal subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Trialing,
    Active,
    Cancelled,
    Expired,
}

string_enum!(SubscriptionStatus, "subscription status", {
    Pending => "pending",
    Trialing => "trialing",
    Active => "active",
    Cancelled => "cancelled",
    Expired => "expired",
});

impl SubscriptionStatus {
    /// Active and trialing subscriptions grant entitlements. At most one
    /// such row may exist per account.
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

/// Listing moderation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Draft,
    Pending,
    Approved,
    Rejected,
}

string_enum!(ListingStatus, "listing status", {
    Draft => "draft",
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// Ledger entry action. Together with the session id this forms the
/// idempotency key of the boost ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAction {
    Purchased,
    Activated,
}

string_enum!(LedgerAction, "ledger action", {
    Purchased => "purchased",
    Activated => "activated",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub account_type: AccountType,
    pub email: String,
    /// Payment provider customer id, once known
    pub external_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
}

impl Account {
    pub fn new(account_type: AccountType, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_type,
            email: email.into(),
            external_customer_id: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_customer_id(mut self, customer_id: impl Into<String>) -> Self {
        self.external_customer_id = Some(customer_id.into());
        self
    }
}

/// Subscription plan reference data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    /// `None` means unlimited listings
    pub max_listings: Option<i64>,
    pub external_price_id: String,
}

impl SubscriptionPlan {
    pub fn new(
        name: impl Into<String>,
        max_listings: Option<i64>,
        external_price_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            max_listings,
            external_price_id: external_price_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Correlation key to provider events, unique
    pub external_subscription_id: String,
    /// Provider timestamp of the last event applied to this row
    pub last_event_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Values written by a subscription upsert, keyed by `external_subscription_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpsert {
    pub account_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub external_subscription_id: String,
    pub event_at: OffsetDateTime,
}

/// Result of a subscription upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Subscription),
    Updated(Subscription),
    /// The stored row has already seen a newer event; nothing was written
    Stale(Subscription),
}

impl UpsertOutcome {
    pub fn subscription(&self) -> &Subscription {
        match self {
            UpsertOutcome::Inserted(s) | UpsertOutcome::Updated(s) | UpsertOutcome::Stale(s) => s,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, UpsertOutcome::Stale(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: ListingStatus,
    pub is_active: bool,
    pub deleted_at: Option<OffsetDateTime>,
    pub boosted_until: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Listing {
    /// A fresh, active draft listing
    pub fn new(owner_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            status: ListingStatus::Draft,
            is_active: true,
            deleted_at: None,
            boosted_until: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_status(mut self, status: ListingStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether this listing counts against the owner's listing quota
    pub fn consumes_quota(&self) -> bool {
        self.is_active
            && self.deleted_at.is_none()
            && matches!(
                self.status,
                ListingStatus::Draft | ListingStatus::Pending | ListingStatus::Approved
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostPlan {
    pub id: Uuid,
    pub name: String,
    pub duration_days: i64,
    pub price_cents: i64,
    pub external_price_id: String,
}

impl BoostPlan {
    pub fn new(
        name: impl Into<String>,
        duration_days: i64,
        price_cents: i64,
        external_price_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            duration_days,
            price_cents,
            external_price_id: external_price_id.into(),
        }
    }
}

/// Append-only boost ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub plan_id: Uuid,
    pub account_id: Uuid,
    pub external_session_id: String,
    pub action: LedgerAction,
    pub amount_cents: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub listing_id: Uuid,
    pub plan_id: Uuid,
    pub account_id: Uuid,
    pub external_session_id: String,
    pub action: LedgerAction,
    pub amount_cents: i64,
}

impl NewLedgerEntry {
    pub fn into_entry(self, created_at: OffsetDateTime) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            listing_id: self.listing_id,
            plan_id: self.plan_id,
            account_id: self.account_id,
            external_session_id: self.external_session_id,
            action: self.action,
            amount_cents: self.amount_cents,
            created_at,
        }
    }
}

/// A boost window extension together with the `activated` ledger row that
/// marks it applied. Stores write both or neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoostActivation {
    pub listing_id: Uuid,
    /// Window value the new one was computed from (compare-and-set guard)
    pub expected_boosted_until: Option<OffsetDateTime>,
    pub new_boosted_until: OffsetDateTime,
    pub entry: NewLedgerEntry,
}

/// Result of applying a [`BoostActivation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoostWrite {
    Applied(LedgerEntry),
    /// An `activated` row for the session already exists; nothing was written
    AlreadyActivated,
    /// The listing's window changed since it was read; nothing was written
    WindowMoved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub external_event_id: String,
    pub event_type: String,
    pub processed_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_enums_round_trip_through_storage_text() {
        assert_eq!(
            "professional".parse::<AccountType>().ok(),
            Some(AccountType::Professional)
        );
        assert_eq!(SubscriptionStatus::Cancelled.as_str(), "cancelled");
        assert_eq!(LedgerAction::Activated.to_string(), "activated");

        let err = "gold".parse::<AccountType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown account type 'gold'");
    }

    #[test]
    fn test_live_statuses() {
        assert!(SubscriptionStatus::Active.is_live());
        assert!(SubscriptionStatus::Trialing.is_live());
        assert!(!SubscriptionStatus::Pending.is_live());
        assert!(!SubscriptionStatus::Cancelled.is_live());
        assert!(!SubscriptionStatus::Expired.is_live());
    }

    #[test]
    fn test_quota_consuming_predicate() {
        let owner = Uuid::new_v4();
        assert!(Listing::new(owner).consumes_quota());
        assert!(Listing::new(owner)
            .with_status(ListingStatus::Approved)
            .consumes_quota());
        assert!(!Listing::new(owner)
            .with_status(ListingStatus::Rejected)
            .consumes_quota());

        let mut inactive = Listing::new(owner);
        inactive.is_active = false;
        assert!(!inactive.consumes_quota());

        let mut deleted = Listing::new(owner);
        deleted.deleted_at = Some(OffsetDateTime::now_utc());
        assert!(!deleted.consumes_quota());
    }
}
