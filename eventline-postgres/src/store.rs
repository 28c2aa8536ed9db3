use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::num::NonZeroU32;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventline::errors::{StoreError, StoreResult};
use eventline::store::{ensure_persistable, Criteria, LoadOptions, MessageStream, Store};
use eventline::types::{EventId, StreamName, Timestamp};
use eventline::{Event, Headers, Message};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::sql::{to_bigint, Bind, SqlFilter};
use crate::{map_sqlx_error, PostgresConfig};

const SELECT_COLUMNS: &str = "SELECT idx, event_id, stream_name, playhead, event_type, event_data, \
     custom_headers, recorded_on, archived, new_stream_start FROM eventline_events";

/// Message log stored in `eventline_events`.
///
/// Events are persisted as JSON, so `E` must round-trip through serde. The
/// `BIGSERIAL` primary key is the store index; it may have gaps when an
/// append transaction rolls back.
pub struct PostgresStore<E> {
    pool: Pool<Postgres>,
    batch_size: i64,
    append_lock_key: i64,
    _event: PhantomData<fn() -> E>,
}

impl<E> Clone for PostgresStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            batch_size: self.batch_size,
            append_lock_key: self.append_lock_key,
            _event: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for PostgresStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("batch_size", &self.batch_size)
            .field("append_lock_key", &self.append_lock_key)
            .finish_non_exhaustive()
    }
}

impl<E> PostgresStore<E> {
    /// Wraps an existing pool.
    pub fn from_pool(pool: Pool<Postgres>, config: &PostgresConfig) -> Self {
        let batch_size: NonZeroU32 = config.batch_size.into();
        Self {
            pool,
            batch_size: i64::from(batch_size.get()),
            append_lock_key: config.lock_key.wrapping_add(1),
            _event: PhantomData,
        }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl<E> Store<E> for PostgresStore<E>
where
    E: Event + Serialize + DeserializeOwned,
{
    #[instrument(name = "postgres.load", skip(self))]
    async fn load(
        &self,
        criteria: &Criteria,
        options: LoadOptions,
    ) -> StoreResult<Box<dyn MessageStream<E>>> {
        let filter = SqlFilter::build_where(criteria)?;
        debug!(
            filter = %filter.where_sql(),
            "[postgres.load] opening message stream"
        );
        Ok(Box::new(PgMessageStream::new(
            self.pool.clone(),
            filter,
            options,
            self.batch_size,
        )))
    }

    #[instrument(name = "postgres.count", skip(self))]
    async fn count(&self, criteria: &Criteria) -> StoreResult<u64> {
        let filter = SqlFilter::build_where(criteria)?;
        let sql = format!("SELECT COUNT(*) FROM eventline_events{}", filter.where_sql());
        let row = filter
            .bind_to(query(&sql))
            .fetch_one(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, "count"))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|error| map_sqlx_error(error, "count"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    #[instrument(name = "postgres.save", skip(self, messages), fields(count = messages.len()))]
    async fn save(&self, messages: Vec<Message<E>>) -> StoreResult<()> {
        ensure_persistable(&messages)?;
        if messages.is_empty() {
            return Ok(());
        }

        let now = Timestamp::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, "begin"))?;

        query("SELECT pg_advisory_xact_lock($1)")
            .bind(self.append_lock_key)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, "lock"))?;

        let count = messages.len();
        for message in messages {
            let stream = message.stream_name()?.clone();
            let playhead = message.playhead()?;
            let event_type = message.event_type();
            let (event, headers) = message.into_parts();

            if headers.new_stream_start {
                let archived = query(
                    "UPDATE eventline_events SET archived = TRUE
                     WHERE stream_name = $1 AND archived = FALSE",
                )
                .bind(stream.as_ref())
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, "archive"))?;
                debug!(
                    stream = %stream,
                    archived = archived.rows_affected(),
                    "[postgres.save] archived earlier messages"
                );
            }

            let event_data = serde_json::to_value(&event)
                .map_err(|error| StoreError::SerializationFailed(error.to_string()))?;
            let custom = serde_json::to_value(&headers.custom)
                .map_err(|error| StoreError::SerializationFailed(error.to_string()))?;
            let recorded_on: DateTime<Utc> = headers.recorded_on.unwrap_or(now).into();

            query(
                "INSERT INTO eventline_events (event_id, stream_name, playhead, event_type, \
                 event_data, custom_headers, recorded_on, archived, new_stream_start)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(*headers.event_id)
            .bind(stream.as_ref())
            .bind(to_bigint(playhead))
            .bind(event_type)
            .bind(Json(event_data))
            .bind(Json(custom))
            .bind(recorded_on)
            .bind(headers.archived)
            .bind(headers.new_stream_start)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, "append"))?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, "commit"))?;
        info!(count, "[postgres.save] appended messages");
        Ok(())
    }
}

/// Keyset-paginated reader over `eventline_events`.
///
/// Pages are fetched lazily, `batch_size` rows at a time, continuing after
/// the last index seen. The offset only applies to the first page.
struct PgMessageStream<E> {
    pool: Option<Pool<Postgres>>,
    filter: SqlFilter,
    backwards: bool,
    batch_size: i64,
    remaining: Option<usize>,
    offset: usize,
    cursor: Option<i64>,
    buffer: VecDeque<(u64, Message<E>)>,
    exhausted: bool,
    current: Option<(u64, Message<E>)>,
    yielded: u64,
}

impl<E> PgMessageStream<E>
where
    E: Event + DeserializeOwned,
{
    fn new(pool: Pool<Postgres>, filter: SqlFilter, options: LoadOptions, batch_size: i64) -> Self {
        Self {
            pool: Some(pool),
            filter,
            backwards: options.backwards,
            batch_size,
            remaining: options.limit,
            offset: options.offset.unwrap_or(0),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            current: None,
            yielded: 0,
        }
    }

    fn page_size(&self) -> i64 {
        self.remaining.map_or(self.batch_size, |remaining| {
            self.batch_size
                .min(i64::try_from(remaining).unwrap_or(i64::MAX))
        })
    }

    async fn fetch_page(&mut self) -> StoreResult<()> {
        let Some(pool) = self.pool.as_ref() else {
            self.exhausted = true;
            return Ok(());
        };
        let page_size = self.page_size();
        if page_size == 0 {
            self.exhausted = true;
            return Ok(());
        }

        let mut filter = self.filter.clone();
        if let Some(cursor) = self.cursor {
            let condition = if self.backwards { "idx < {}" } else { "idx > {}" };
            filter.push(condition, Bind::BigInt(cursor));
        }
        let limit = filter.next_placeholder();
        let offset = format!("${}", filter.binds().len() + 2);
        let sql = format!(
            "{SELECT_COLUMNS}{} ORDER BY idx {} LIMIT {limit} OFFSET {offset}",
            filter.where_sql(),
            if self.backwards { "DESC" } else { "ASC" },
        );

        let rows = filter
            .bind_to(query(&sql))
            .bind(page_size)
            .bind(i64::try_from(self.offset).unwrap_or(i64::MAX))
            .fetch_all(pool)
            .await
            .map_err(|error| map_sqlx_error(error, "load"))?;
        self.offset = 0;

        let fetched = rows.len();
        for row in rows {
            let (index, message) = decode_row::<E>(&row)?;
            self.cursor = Some(to_bigint(index));
            self.buffer.push_back((index, message));
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(fetched);
        }
        if i64::try_from(fetched).unwrap_or(i64::MAX) < page_size {
            self.exhausted = true;
        }
        debug!(fetched, "[postgres.load] fetched page");
        Ok(())
    }
}

#[async_trait]
impl<E> MessageStream<E> for PgMessageStream<E>
where
    E: Event + DeserializeOwned,
{
    async fn advance(&mut self) -> StoreResult<bool> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        match self.buffer.pop_front() {
            Some(next) => {
                self.current = Some(next);
                self.yielded += 1;
                Ok(true)
            }
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    fn current(&self) -> Option<&Message<E>> {
        self.current.as_ref().map(|(_, message)| message)
    }

    fn index(&self) -> Option<u64> {
        self.current.as_ref().map(|(index, _)| *index)
    }

    fn position(&self) -> Option<u64> {
        self.yielded.checked_sub(1)
    }

    fn end(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    fn close(&mut self) {
        self.pool = None;
        self.buffer.clear();
        self.exhausted = true;
    }
}

fn decode_row<E: DeserializeOwned>(row: &PgRow) -> StoreResult<(u64, Message<E>)> {
    let decode = |error: sqlx::Error| StoreError::DeserializationFailed(error.to_string());

    let index: i64 = row.try_get("idx").map_err(decode)?;
    let event_id: Uuid = row.try_get("event_id").map_err(decode)?;
    let stream_name: String = row.try_get("stream_name").map_err(decode)?;
    let playhead: i64 = row.try_get("playhead").map_err(decode)?;
    let Json(event_data): Json<Value> = row.try_get("event_data").map_err(decode)?;
    let Json(custom): Json<BTreeMap<String, Value>> =
        row.try_get("custom_headers").map_err(decode)?;
    let recorded_on: DateTime<Utc> = row.try_get("recorded_on").map_err(decode)?;
    let archived: bool = row.try_get("archived").map_err(decode)?;
    let new_stream_start: bool = row.try_get("new_stream_start").map_err(decode)?;

    let invalid = |what: &str, detail: String| {
        StoreError::DeserializationFailed(format!("row {index}: invalid {what}: {detail}"))
    };
    let headers = Headers {
        event_id: EventId::try_new(event_id).map_err(|error| invalid("event id", error.to_string()))?,
        stream_name: Some(
            StreamName::try_new(stream_name)
                .map_err(|error| invalid("stream name", error.to_string()))?,
        ),
        playhead: Some(
            u64::try_from(playhead).map_err(|error| invalid("playhead", error.to_string()))?,
        ),
        recorded_on: Some(Timestamp::from(recorded_on)),
        archived,
        new_stream_start,
        custom,
    };
    let event: E = serde_json::from_value(event_data)
        .map_err(|error| invalid("event payload", error.to_string()))?;
    let index = u64::try_from(index).map_err(|error| invalid("index", error.to_string()))?;

    Ok((index, Message::from_parts(event, headers)))
}
