use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventline::errors::{SubscriptionStoreError, SubscriptionStoreResult};
use eventline::subscription::{
    LockableSubscriptionStore, RecordedError, RunMode, Status, Subscription, SubscriptionCriteria,
    SubscriptionRecord, SubscriptionStore,
};
use eventline::types::{SubscriberId, Timestamp};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::sql::to_bigint;
use crate::{is_unique_violation, map_subscription_error, PostgresConfig};

const SELECT_COLUMNS: &str = "SELECT id, group_name, run_mode, status, position, error, \
     retry_attempt, last_saved_at FROM eventline_subscriptions";

/// Subscription records stored in `eventline_subscriptions`.
///
/// The engine lock is a session-level `pg_advisory_lock` taken on a
/// connection pinned out of the pool until [`release_lock`] runs, so it also
/// excludes engines in other processes. Clones share the pinned connection.
///
/// [`release_lock`]: LockableSubscriptionStore::release_lock
#[derive(Clone)]
pub struct PostgresSubscriptionStore {
    pool: Pool<Postgres>,
    lock_key: i64,
    held: Arc<Mutex<Option<PoolConnection<Postgres>>>>,
}

impl std::fmt::Debug for PostgresSubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSubscriptionStore")
            .field("lock_key", &self.lock_key)
            .finish_non_exhaustive()
    }
}

impl PostgresSubscriptionStore {
    /// Wraps an existing pool.
    pub fn from_pool(pool: Pool<Postgres>, config: &PostgresConfig) -> Self {
        Self {
            pool,
            lock_key: config.lock_key,
            held: Arc::new(Mutex::new(None)),
        }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

fn statuses(criteria: &SubscriptionCriteria) -> Option<Vec<String>> {
    criteria
        .statuses
        .as_ref()
        .map(|statuses| statuses.iter().map(|s| s.as_str().to_string()).collect())
}

fn decode_row(row: &PgRow) -> SubscriptionStoreResult<Subscription> {
    let decode = |error: sqlx::Error| SubscriptionStoreError::SerializationFailed(error.to_string());
    let invalid = |what: &str, detail: String| {
        SubscriptionStoreError::SerializationFailed(format!("invalid {what}: {detail}"))
    };

    let id: String = row.try_get("id").map_err(decode)?;
    let group: String = row.try_get("group_name").map_err(decode)?;
    let run_mode: String = row.try_get("run_mode").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let position: i64 = row.try_get("position").map_err(decode)?;
    let error: Option<Json<RecordedError>> = row.try_get("error").map_err(decode)?;
    let retry_attempt: i32 = row.try_get("retry_attempt").map_err(decode)?;
    let last_saved_at: Option<DateTime<Utc>> = row.try_get("last_saved_at").map_err(decode)?;

    Ok(Subscription::from_record(SubscriptionRecord {
        id: SubscriberId::try_new(id).map_err(|error| invalid("id", error.to_string()))?,
        group,
        run_mode: run_mode
            .parse::<RunMode>()
            .map_err(|error| invalid("run mode", error.to_string()))?,
        status: status
            .parse::<Status>()
            .map_err(|error| invalid("status", error.to_string()))?,
        position: u64::try_from(position)
            .map_err(|error| invalid("position", error.to_string()))?,
        error: error.map(|Json(error)| error),
        retry_attempt: u32::try_from(retry_attempt)
            .map_err(|error| invalid("retry attempt", error.to_string()))?,
        last_saved_at: last_saved_at.map(Timestamp::from),
    }))
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    async fn get(&self, id: &SubscriberId) -> SubscriptionStoreResult<Option<Subscription>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = query(&sql)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_subscription_error(error, "get"))?;
        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(name = "postgres.subscriptions.find", skip(self))]
    async fn find(
        &self,
        criteria: &SubscriptionCriteria,
    ) -> SubscriptionStoreResult<Vec<Subscription>> {
        let ids: Option<Vec<String>> = criteria
            .ids
            .as_ref()
            .map(|ids| ids.iter().map(ToString::to_string).collect());
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE ($1::text[] IS NULL OR id = ANY($1))
               AND ($2::text[] IS NULL OR group_name = ANY($2))
               AND ($3::text[] IS NULL OR status = ANY($3))
             ORDER BY id"
        );
        let rows = query(&sql)
            .bind(ids)
            .bind(criteria.groups.clone())
            .bind(statuses(criteria))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_subscription_error(error, "find"))?;
        debug!(count = rows.len(), "[postgres.subscriptions.find] loaded records");
        rows.iter().map(decode_row).collect()
    }

    async fn add(&self, subscription: &Subscription) -> SubscriptionStoreResult<()> {
        let record = subscription.to_record();
        let result = query(
            "INSERT INTO eventline_subscriptions
                 (id, group_name, run_mode, status, position, error, retry_attempt, last_saved_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id.as_ref())
        .bind(record.group.as_str())
        .bind(record.run_mode.as_str())
        .bind(record.status.as_str())
        .bind(to_bigint(record.position))
        .bind(record.error.clone().map(Json))
        .bind(i32::try_from(record.retry_attempt).unwrap_or(i32::MAX))
        .bind(record.last_saved_at.map(DateTime::<Utc>::from))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => {
                Err(SubscriptionStoreError::AlreadyExists(record.id))
            }
            Err(error) => Err(map_subscription_error(error, "add")),
        }
    }

    async fn update(&self, subscription: &Subscription) -> SubscriptionStoreResult<()> {
        let record = subscription.to_record();
        let result = query(
            "UPDATE eventline_subscriptions
             SET group_name = $2, run_mode = $3, status = $4, position = $5, error = $6,
                 retry_attempt = $7, last_saved_at = $8
             WHERE id = $1",
        )
        .bind(record.id.as_ref())
        .bind(record.group.as_str())
        .bind(record.run_mode.as_str())
        .bind(record.status.as_str())
        .bind(to_bigint(record.position))
        .bind(record.error.clone().map(Json))
        .bind(i32::try_from(record.retry_attempt).unwrap_or(i32::MAX))
        .bind(record.last_saved_at.map(DateTime::<Utc>::from))
        .execute(&self.pool)
        .await
        .map_err(|error| map_subscription_error(error, "update"))?;

        if result.rows_affected() == 0 {
            return Err(SubscriptionStoreError::NotFound(record.id));
        }
        Ok(())
    }

    async fn remove(&self, subscription: &Subscription) -> SubscriptionStoreResult<()> {
        query("DELETE FROM eventline_subscriptions WHERE id = $1")
            .bind(subscription.id().as_ref())
            .execute(&self.pool)
            .await
            .map_err(|error| map_subscription_error(error, "remove"))?;
        Ok(())
    }

    fn as_lockable(&self) -> Option<&dyn LockableSubscriptionStore> {
        Some(self)
    }
}

#[async_trait]
impl LockableSubscriptionStore for PostgresSubscriptionStore {
    #[instrument(name = "postgres.lock.acquire", skip(self))]
    async fn acquire_lock(&self) -> SubscriptionStoreResult<()> {
        let lock_failed = |error: sqlx::Error| SubscriptionStoreError::LockFailed(error.to_string());

        let mut connection = self.pool.acquire().await.map_err(lock_failed)?;
        query("SELECT pg_advisory_lock($1)")
            .bind(self.lock_key)
            .execute(&mut *connection)
            .await
            .map_err(lock_failed)?;

        let mut held = self.held.lock().await;
        if held.is_some() {
            // Postgres granted a second session the lock, so the pinned one is gone.
            warn!("[postgres.lock.acquire] replacing a stale lock connection");
        }
        *held = Some(connection);
        info!(lock_key = self.lock_key, "[postgres.lock.acquire] lock acquired");
        Ok(())
    }

    #[instrument(name = "postgres.lock.release", skip(self))]
    async fn release_lock(&self) -> SubscriptionStoreResult<()> {
        let Some(mut connection) = self.held.lock().await.take() else {
            return Err(SubscriptionStoreError::LockFailed(
                "lock is not held".to_string(),
            ));
        };

        let row = query("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut *connection)
            .await
            .map_err(|error| SubscriptionStoreError::LockFailed(error.to_string()))?;
        let released: bool = row
            .try_get(0)
            .map_err(|error| SubscriptionStoreError::LockFailed(error.to_string()))?;
        if !released {
            return Err(SubscriptionStoreError::LockFailed(format!(
                "advisory lock {} was not held by this session",
                self.lock_key
            )));
        }
        debug!(lock_key = self.lock_key, "[postgres.lock.release] lock released");
        Ok(())
    }
}
