//! Provider webhook payloads
//!
//! Only the fields the reconciler reads are modelled. Stripe adds fields
//! across API versions, so unknown fields are ignored and most known ones
//! are optional.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Metadata key carrying the checkout purpose
pub const METADATA_TYPE: &str = "type";
pub const METADATA_TYPE_BOOST: &str = "boost";
pub const METADATA_TYPE_SUBSCRIPTION: &str = "subscription";
pub const METADATA_ACCOUNT_ID: &str = "accountId";
pub const METADATA_LISTING_ID: &str = "listingId";
pub const METADATA_PLAN_ID: &str = "planId";

/// A verified webhook event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the provider created the event
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// Event types the reconciler dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    CheckoutSessionAsyncPaymentSucceeded,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Other,
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "checkout.session.async_payment_succeeded" => {
                EventKind::CheckoutSessionAsyncPaymentSucceeded
            }
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "invoice.paid" | "invoice.payment_succeeded" => EventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            _ => EventKind::Other,
        }
    }
}

impl WebhookEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload)
            .map_err(|e| BillingError::Validation(format!("malformed webhook payload: {}", e)))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// Provider creation time; falls back to now for a missing or invalid stamp
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .ok()
            .filter(|_| self.created > 0)
            .unwrap_or_else(OffsetDateTime::now_utc)
    }

    /// Deserialize `data.object` into the expected shape
    pub fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::Validation(format!(
                "unexpected object for {} event: {}",
                self.event_type, e
            ))
        })
    }
}

/// A customer reference, either a bare id or an expanded object
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CustomerRef {
    Id(String),
    Object {
        id: String,
        #[serde(default)]
        email: Option<String>,
    },
}

impl CustomerRef {
    pub fn id(&self) -> &str {
        match self {
            CustomerRef::Id(id) | CustomerRef::Object { id, .. } => id,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            CustomerRef::Id(_) => None,
            CustomerRef::Object { email, .. } => email.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub customer: Option<CustomerRef>,
}

impl CheckoutSessionObject {
    pub fn is_boost(&self) -> bool {
        self.metadata.get(METADATA_TYPE).map(String::as_str) == Some(METADATA_TYPE_BOOST)
    }

    /// Completed sessions may still await an asynchronous payment
    pub fn is_paid(&self) -> bool {
        match self.payment_status.as_deref() {
            None => true,
            Some(status) => status == "paid" || status == "no_payment_required",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<CustomerRef>,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: SubscriptionItems,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<PriceRef>,
    // Newer API versions report billing periods per item
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

impl SubscriptionObject {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.as_str())
    }

    pub fn period_start(&self) -> Option<OffsetDateTime> {
        self.current_period_start
            .or_else(|| self.items.data.first().and_then(|i| i.current_period_start))
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
    }

    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .or_else(|| self.items.data.first().and_then(|i| i.current_period_end))
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!(
            EventKind::parse("checkout.session.completed"),
            EventKind::CheckoutSessionCompleted
        );
        assert_eq!(
            EventKind::parse("invoice.paid"),
            EventKind::InvoicePaymentSucceeded
        );
        assert_eq!(EventKind::parse("charge.refunded"), EventKind::Other);
    }

    #[test]
    fn test_subscription_object_with_item_level_periods() {
        let object: SubscriptionObject = serde_json::from_value(serde_json::json!({
            "id": "sub_123",
            "customer": "cus_1",
            "status": "active",
            "items": { "data": [{
                "price": { "id": "price_pro" },
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_592_000
            }]},
            "unknown_field": { "nested": true }
        }))
        .unwrap();

        assert_eq!(object.price_id(), Some("price_pro"));
        assert_eq!(object.customer.as_ref().map(|c| c.id()), Some("cus_1"));
        assert_eq!(
            object.period_end().map(|t| t.unix_timestamp()),
            Some(1_702_592_000)
        );
        assert!(!object.cancel_at_period_end);
    }

    #[test]
    fn test_expanded_customer_carries_email() {
        let customer: CustomerRef = serde_json::from_value(serde_json::json!({
            "id": "cus_9",
            "email": "seller@example.com",
            "object": "customer"
        }))
        .unwrap();
        assert_eq!(customer.id(), "cus_9");
        assert_eq!(customer.email(), Some("seller@example.com"));
    }

    #[test]
    fn test_checkout_payment_status() {
        let session: CheckoutSessionObject = serde_json::from_value(serde_json::json!({
            "id": "cs_1",
            "payment_status": "unpaid",
            "metadata": { "type": "boost" }
        }))
        .unwrap();
        assert!(session.is_boost());
        assert!(!session.is_paid());
    }
}
