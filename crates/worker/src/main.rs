//! Marketplace Background Worker
//!
//! Handles scheduled jobs:
//! - Billing invariant checks (hourly)
//! - Heartbeat (every 5 minutes)
//!
//! The invariant checks are SQL over the shared PostgreSQL store, so the
//! worker refuses to start when `STORE_BACKEND` selects the in-memory store.
//! Stripe settings are not needed here and are not read.

use std::sync::Arc;

use marketplace_billing::{InvariantCheckSummary, InvariantChecker, ViolationSeverity};
use marketplace_shared::StoreBackend;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Database URL for the invariant checks, honouring the store selection
fn invariant_database_url(
    store_backend: Option<&str>,
    database_url: Option<String>,
) -> anyhow::Result<String> {
    let backend = match store_backend.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value.parse::<StoreBackend>().map_err(|e| anyhow::anyhow!(e))?,
        None => StoreBackend::Postgres,
    };
    if backend != StoreBackend::Postgres {
        anyhow::bail!("invariant checks require STORE_BACKEND=postgres, got {:?}", backend);
    }

    database_url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required when STORE_BACKEND=postgres"))
}

/// Create a database connection pool and bring the schema up to date
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = invariant_database_url(
        std::env::var("STORE_BACKEND").ok().as_deref(),
        std::env::var("DATABASE_URL").ok(),
    )?;

    let pool = marketplace_shared::create_pool(&database_url).await?;
    marketplace_shared::run_migrations(&pool).await?;
    Ok(pool)
}

/// Log the outcome of an invariant run, one line per violation
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Invariant check cycle complete - no violations"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        critical = summary.count_at_least(ViolationSeverity::Critical),
        "Invariant check cycle found violations"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                account_ids = ?violation.account_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                account_ids = ?violation.account_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Marketplace Worker");

    let pool = create_db_pool().await?;
    let checker = Arc::new(InvariantChecker::new(pool));

    info!(
        checks = ?InvariantChecker::available_checks(),
        "Invariant checks registered"
    );

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing invariants
    // Cron: At minute 0 of every hour
    let hourly_checker = Arc::clone(&checker);
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = Arc::clone(&hourly_checker);
            Box::pin(async move {
                info!("Running scheduled billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (hourly)");

    // Job 2: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Marketplace Worker started successfully with 2 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received - stopping scheduler");

    let mut scheduler = scheduler;
    scheduler.shutdown().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_defaults_to_postgres() {
        let url = invariant_database_url(None, Some("postgres://localhost/market".to_string()));
        assert_eq!(url.unwrap(), "postgres://localhost/market");
    }

    #[test]
    fn test_memory_backend_is_refused() {
        let err = invariant_database_url(Some("memory"), Some("postgres://x".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn test_postgres_requires_url() {
        assert!(invariant_database_url(Some("postgres"), None).is_err());
        assert!(invariant_database_url(Some("postgres"), Some("  ".to_string())).is_err());
        assert!(invariant_database_url(Some("sqlite"), Some("x".to_string())).is_err());
    }
}
