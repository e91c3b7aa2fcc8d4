//! Billing error types

use marketplace_shared::StoreError;
use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = std::result::Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed input; rejected without mutation
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    /// Referenced entity missing; the event stays unprocessed for retry
    #[error("Not found: {0}")]
    NotFound(String),

    /// Idempotent replay or unique-constraint race; callers treat it as success
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Account not found: {0}")]
    AccountLookup(Uuid),

    /// Subscription event could not be attributed to an account
    #[error("Unable to resolve account for subscription {0}")]
    UnresolvedAccount(String),

    /// The account already holds another active or trialing subscription
    #[error("Account {0} already has a live subscription")]
    LiveSubscriptionExists(Uuid),

    /// Store or provider unavailable
    #[error("Temporarily unavailable: {0}")]
    Transient(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether redelivering the same input may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::NotFound(_)
                | BillingError::UnresolvedAccount(_)
                | BillingError::LiveSubscriptionExists(_)
                | BillingError::Transient(_)
                | BillingError::StripeApi(_)
                | BillingError::Internal(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BillingError::Conflict(_))
    }
}

impl From<StoreError> for BillingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation(constraint) => BillingError::Conflict(constraint),
            StoreError::NotFound(what) => BillingError::NotFound(what),
            StoreError::Unavailable(msg) => BillingError::Transient(msg),
            StoreError::InvalidData(msg) | StoreError::Backend(msg) => BillingError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::from(e).into()
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let conflict: BillingError = StoreError::UniqueViolation("k".into()).into();
        assert!(conflict.is_conflict());
        assert!(!conflict.is_retryable());

        let transient: BillingError = StoreError::Unavailable("pool timed out".into()).into();
        assert!(matches!(transient, BillingError::Transient(_)));
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_rejections_are_not_retryable() {
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::Validation("bad".into()).is_retryable());
        assert!(BillingError::UnresolvedAccount("sub_1".into()).is_retryable());
    }
}
