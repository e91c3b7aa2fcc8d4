//! Billing configuration loaded from the environment

use marketplace_shared::StoreBackend;

use crate::error::{BillingError, BillingResult};

/// Default tolerance for webhook timestamps (5 minutes)
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Upper bound accepted for `BOOST_MAX_HORIZON_DAYS` (ten years)
pub const MAX_BOOST_HORIZON_DAYS: i64 = 3650;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Maximum age of a signed webhook timestamp, in seconds
    pub webhook_tolerance_secs: i64,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe: StripeConfig,
    /// Furthest a boost purchase may push a listing's window, in days from now.
    /// `None` allows unbounded stacking.
    pub boost_max_horizon_days: Option<i64>,
    /// Endpoint receiving notification POSTs; notifications are only logged when unset
    pub notification_webhook_url: Option<String>,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        dotenvy::dotenv().ok();

        let stripe = StripeConfig {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            webhook_tolerance_secs: parsed("STRIPE_WEBHOOK_TOLERANCE_SECS")?
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS),
        };

        let boost_max_horizon_days =
            validate_horizon_days(parsed::<i64>("BOOST_MAX_HORIZON_DAYS")?)?;

        let store_backend = match optional("STORE_BACKEND") {
            Some(value) => value.parse().map_err(BillingError::Config)?,
            None => StoreBackend::Postgres,
        };
        let database_url = optional("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(BillingError::Config(
                "DATABASE_URL is required when STORE_BACKEND=postgres".to_string(),
            ));
        }

        Ok(Self {
            stripe,
            boost_max_horizon_days,
            notification_webhook_url: optional("NOTIFICATION_WEBHOOK_URL"),
            store_backend,
            database_url,
        })
    }
}

fn validate_horizon_days(days: Option<i64>) -> BillingResult<Option<i64>> {
    match days {
        Some(days) if !(1..=MAX_BOOST_HORIZON_DAYS).contains(&days) => {
            Err(BillingError::Config(format!(
                "BOOST_MAX_HORIZON_DAYS must be between 1 and {}, got {}",
                MAX_BOOST_HORIZON_DAYS, days
            )))
        }
        days => Ok(days),
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &str) -> BillingResult<String> {
    optional(key).ok_or_else(|| BillingError::Config(format!("{} must be set", key)))
}

fn parsed<T: std::str::FromStr>(key: &str) -> BillingResult<Option<T>> {
    optional(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", key, v)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_horizon_days_bounds() {
        assert_eq!(validate_horizon_days(None).unwrap(), None);
        assert_eq!(validate_horizon_days(Some(30)).unwrap(), Some(30));
        assert_eq!(
            validate_horizon_days(Some(MAX_BOOST_HORIZON_DAYS)).unwrap(),
            Some(MAX_BOOST_HORIZON_DAYS)
        );

        for days in [0, -1, MAX_BOOST_HORIZON_DAYS + 1, 200_000_000_000_000] {
            assert!(
                matches!(validate_horizon_days(Some(days)), Err(BillingError::Config(_))),
                "{} days should be rejected",
                days
            );
        }
    }
}
