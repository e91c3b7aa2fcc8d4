// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Marketplace Shared Types
//!
//! Domain model, the storage interface consumed by the billing engine, and
//! its two implementations (PostgreSQL and in-memory).

pub mod memory;
pub mod postgres;
pub mod repository;
pub mod types;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use memory::InMemoryRepository;
pub use postgres::PgRepository;
pub use repository::{
    Repository, StoreError, StoreResult, LEDGER_SESSION_ACTION_CONSTRAINT,
    LIVE_SUBSCRIPTION_CONSTRAINT, PROCESSED_EVENT_CONSTRAINT,
};
pub use types::*;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Apply embedded migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Storage backend, chosen once from configuration at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Build the repository for the configured backend.
///
/// The PostgreSQL backend requires `database_url`; migrations are applied
/// before the repository is returned.
pub async fn connect_repository(
    backend: StoreBackend,
    database_url: Option<&str>,
) -> StoreResult<Arc<dyn Repository>> {
    match backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store - state is lost on restart");
            Ok(Arc::new(InMemoryRepository::new()))
        }
        StoreBackend::Postgres => {
            let url = database_url.ok_or_else(|| {
                StoreError::Unavailable("DATABASE_URL is required for the postgres store".into())
            })?;
            let pool = create_pool(url).await?;
            run_migrations(&pool)
                .await
                .map_err(|e| StoreError::Backend(format!("migration failed: {}", e)))?;
            Ok(Arc::new(PgRepository::new(pool)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backend_parsing() {
        assert_eq!("postgres".parse(), Ok(StoreBackend::Postgres));
        assert_eq!(" Memory ".parse(), Ok(StoreBackend::Memory));
        assert!("redis".parse::<StoreBackend>().is_err());
    }

    #[tokio::test]
    async fn test_postgres_backend_requires_url() {
        let result = connect_repository(StoreBackend::Postgres, None).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
