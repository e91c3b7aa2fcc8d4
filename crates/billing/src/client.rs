//! Payment provider client
//!
//! [`PaymentProvider`] is the seam between the engine and Stripe: checkout
//! session creation, customer lookup and webhook verification.

use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, Customer, CustomerId,
};
use time::OffsetDateTime;

use crate::config::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::payload::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutMode {
    /// One-off payment (boosts)
    Payment,
    Subscription,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub mode: CheckoutMode,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCheckoutSession {
    pub session_id: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<CreatedCheckoutSession>;

    /// Email stored on the provider's customer record
    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>>;

    /// Verify the signature header and parse the event envelope
    fn verify_webhook(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent>;
}

/// Verifies Stripe `t=<unix>,v1=<hex hmac>` signature headers
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_at(&self, payload: &str, signature: &str, now: i64) -> BillingResult<WebhookEvent> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let age = now.abs_diff(timestamp);
        if age > u64::try_from(self.tolerance_secs).unwrap_or(0) {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let matched = candidates.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
                return false;
            };
            mac.update(signed_payload.as_bytes());
            // Constant-time comparison
            mac.verify_slice(&expected).is_ok()
        });

        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        WebhookEvent::parse(payload)
    }

    /// Build a signature header for `payload` as the provider would
    pub fn sign(&self, payload: &str, timestamp: i64) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| BillingError::Config(format!("invalid webhook secret: {}", e)))?;
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }
}

/// Stripe client wrapper
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
    verifier: WebhookVerifier,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        let verifier =
            WebhookVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance_secs);
        Self {
            client,
            config,
            verifier,
        }
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<CreatedCheckoutSession> {
        let customer = match request.customer_id.as_deref() {
            Some(id) => Some(id.parse::<CustomerId>().map_err(|e| {
                BillingError::Validation(format!("invalid customer id {}: {}", id, e))
            })?),
            None => None,
        };

        let line_items = vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }];

        let mut params = CreateCheckoutSession {
            customer,
            line_items: Some(line_items),
            success_url: Some(&request.success_url),
            cancel_url: Some(&request.cancel_url),
            metadata: Some(request.metadata.clone()),
            ..Default::default()
        };

        match request.mode {
            CheckoutMode::Payment => {
                params.mode = Some(CheckoutSessionMode::Payment);
            }
            CheckoutMode::Subscription => {
                params.mode = Some(CheckoutSessionMode::Subscription);
                // Copied onto the subscription object so its events resolve the account
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    metadata: Some(request.metadata.clone()),
                    ..Default::default()
                });
            }
        }

        let session = match CheckoutSession::create(&self.client, params).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(
                    price_id = %request.price_id,
                    error = %e,
                    "Stripe Checkout Session creation failed"
                );
                return Err(e.into());
            }
        };

        let url = session.url.clone().ok_or_else(|| {
            BillingError::StripeApi(format!("checkout session {} has no url", session.id))
        })?;

        Ok(CreatedCheckoutSession {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let id = customer_id.parse::<CustomerId>().map_err(|e| {
            BillingError::Validation(format!("invalid customer id {}: {}", customer_id, e))
        })?;
        let customer = Customer::retrieve(&self.client, &id, &[]).await?;
        Ok(customer.email)
    }

    fn verify_webhook(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verifier.verify(payload, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"invoice.paid","created":1700000000,"data":{"object":{}}}"#;

    #[test]
    fn test_valid_signature_parses_event() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let header = verifier.sign(PAYLOAD, 1_700_000_000).unwrap();

        let event = verifier.verify_at(PAYLOAD, &header, 1_700_000_010).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "invoice.paid");
    }

    #[test]
    fn test_any_matching_v1_signature_is_accepted() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let header = verifier.sign(PAYLOAD, 1_700_000_000).unwrap();
        let rotated = format!("{},v1={}", header, "00".repeat(32));

        assert!(verifier.verify_at(PAYLOAD, &rotated, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let header = verifier.sign(PAYLOAD, 1_700_000_000).unwrap();
        let tampered = PAYLOAD.replace("evt_1", "evt_2");

        let err = verifier
            .verify_at(&tampered, &header, 1_700_000_000)
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let signer = WebhookVerifier::new("whsec_other", 300);
        let verifier = WebhookVerifier::new(SECRET, 300);
        let header = signer.sign(PAYLOAD, 1_700_000_000).unwrap();

        assert!(verifier.verify_at(PAYLOAD, &header, 1_700_000_000).is_err());
    }

    #[test]
    fn test_timestamp_outside_tolerance_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let header = verifier.sign(PAYLOAD, 1_700_000_000).unwrap();

        let err = verifier
            .verify_at(PAYLOAD, &header, 1_700_000_301)
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_malformed_headers_are_rejected() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        for header in [
            "",
            "t=abc,v1=00",
            "v1=deadbeef",
            "t=1700000000",
            "t=1700000000,v1=zz",
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert!(
                verifier.verify_at(PAYLOAD, header, 1_700_000_000).is_err(),
                "header {:?} should be rejected",
                header
            );
        }
    }

    #[test]
    fn test_signed_but_malformed_payload_is_a_validation_error() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let payload = r#"{"not":"an event"}"#;
        let header = verifier.sign(payload, 1_700_000_000).unwrap();

        let err = verifier
            .verify_at(payload, &header, 1_700_000_000)
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
