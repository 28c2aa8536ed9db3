//! PostgreSQL adapters for `eventline`
//!
//! [`PostgresStore`] keeps the message log in `eventline_events`;
//! [`PostgresSubscriptionStore`] keeps subscription records in
//! `eventline_subscriptions` and serialises engine operations across
//! processes with a session-level advisory lock.
//!
//! Both share one connection pool built from [`PostgresConfig`]. Run
//! [`migrate`] once before first use.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod sql;
mod store;
mod subscription_store;

use std::num::NonZeroU32;
use std::time::Duration;

use eventline::errors::{StoreError, SubscriptionStoreError};
use nutype::nutype;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

pub use sql::{Bind, SqlFilter};
pub use store::PostgresStore;
pub use subscription_store::PostgresSubscriptionStore;

/// Errors raised while preparing the database.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The embedded migrations could not be applied.
    #[error("failed to apply eventline migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// The subscription store pins one connection for as long as it holds the
/// engine lock, so pools shared with the engine need at least two.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Number of rows fetched per page by the streaming reader.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct BatchSize(NonZeroU32);

/// Configuration shared by the Postgres adapters.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Page size of streaming reads (default: 500)
    pub batch_size: BatchSize,
    /// Advisory lock id guarding engine operations
    ///
    /// Append transactions use `lock_key + 1`.
    pub lock_key: i64,
}

/// Default advisory lock id; any value works as long as deployments sharing a
/// database agree on it.
pub const DEFAULT_LOCK_KEY: i64 = 0x6576_656e_746c_696e;

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };
        const DEFAULT_BATCH_SIZE: NonZeroU32 = match NonZeroU32::new(500) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
            batch_size: BatchSize::new(DEFAULT_BATCH_SIZE),
            lock_key: DEFAULT_LOCK_KEY,
        }
    }
}

impl PostgresConfig {
    /// Sets the pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: MaxConnections) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Sets the streaming page size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: BatchSize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the advisory lock id.
    #[must_use]
    pub const fn with_lock_key(mut self, lock_key: i64) -> Self {
        self.lock_key = lock_key;
        self
    }

    /// Opens a connection pool.
    #[instrument(name = "postgres.connect", skip(self, connection_string))]
    pub async fn connect(&self, connection_string: &str) -> Result<Pool<Postgres>, PostgresError> {
        let max_connections: NonZeroU32 = self.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .connect(connection_string)
            .await
            .map_err(PostgresError::ConnectionFailed)?;
        info!(
            max_connections = max_connections.get(),
            "[postgres.connect] connection pool ready"
        );
        Ok(pool)
    }
}

/// Applies the embedded migrations creating both tables.
#[instrument(name = "postgres.migrate", skip(pool))]
pub async fn migrate(pool: &Pool<Postgres>) -> Result<(), PostgresError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(PostgresError::MigrationFailed)?;
    info!("[postgres.migrate] migrations applied");
    Ok(())
}

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some(UNIQUE_VIOLATION))
}

pub(crate) fn map_sqlx_error(error: sqlx::Error, operation: &'static str) -> StoreError {
    if is_unique_violation(&error) {
        warn!(
            error = %error,
            operation,
            "[postgres.unique_violation] append rejected"
        );
        return StoreError::UniqueConstraintViolation(error.to_string());
    }

    error!(
        error = %error,
        operation,
        "[postgres.database_error] database operation failed"
    );
    let detail = error.to_string();
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::ConnectionFailed(detail)
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::DeserializationFailed(detail)
        }
        _ => StoreError::Internal(format!("{operation}: {detail}")),
    }
}

pub(crate) fn map_subscription_error(
    error: sqlx::Error,
    operation: &'static str,
) -> SubscriptionStoreError {
    error!(
        error = %error,
        operation,
        "[postgres.database_error] database operation failed"
    );
    let detail = error.to_string();
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            SubscriptionStoreError::ConnectionFailed(detail)
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            SubscriptionStoreError::SerializationFailed(detail)
        }
        _ => SubscriptionStoreError::Internal(format!("{operation}: {detail}")),
    }
}
