//! Poll-based task event broker backed by a Postgres outbox table.
//!
//! Publishers append envelopes to `task_events`. Consumers poll the table for
//! rows past their cursor and commit the highest processed position per
//! consumer group in `consumer_offsets`.
//!
//! Appends are serialized by a transaction-scoped advisory lock, so positions
//! become visible in increasing order and a cursor never moves past a row that
//! commits later. Rows must therefore only be written through
//! [`OutboxPublisher`]. Each consumer group is held by at most one subscription
//! at a time through a session advisory lock.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use sqlx::{Connection, PgConnection, PgPool, PgTransaction};
use todo_sdk::{
    error::{PublishError, SourceError},
    event::TaskEvent,
    publish::Publisher,
    source::{Delivery, EventBroker, EventSource, Fetched},
};
use tracing::{debug, info, warn};

const DEFAULT_EVENTS_TABLE_NAME: &str = "task_events";
const DEFAULT_OFFSETS_TABLE_NAME: &str = "consumer_offsets";
const DEFAULT_BATCH_SIZE: u32 = 100;

const APPEND_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";
const GROUP_LOCK_SQL: &str = "SELECT pg_try_advisory_lock(hashtext($1))";

/// Creates the outbox and offset tables under their default names.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    create_tables(pool, DEFAULT_EVENTS_TABLE_NAME, DEFAULT_OFFSETS_TABLE_NAME).await
}

async fn create_tables(pool: &PgPool, events_table: &str, offsets_table: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {events_table} (
            position BIGSERIAL PRIMARY KEY,
            topic TEXT NOT NULL,
            payload BYTEA NOT NULL,
            published_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {offsets_table} (
            consumer_group TEXT PRIMARY KEY,
            position BIGINT NOT NULL
        )"
    ))
    .execute(pool)
    .await?;

    Ok(())
}

/// Appends task events to the outbox table.
#[derive(Clone)]
pub struct OutboxPublisher {
    pool: PgPool,
    table: Arc<str>,
}

impl OutboxPublisher {
    pub fn new(pool: PgPool) -> Self {
        OutboxPublisher {
            pool,
            table: DEFAULT_EVENTS_TABLE_NAME.into(),
        }
    }

    pub fn table(mut self, table: impl Into<Arc<str>>) -> Self {
        self.table = table.into();
        self
    }

    /// Appends the event inside the caller's transaction, so it becomes visible
    /// to consumers only if the task mutation commits.
    ///
    /// Other appends wait until `tx` ends, so keep the transaction short after
    /// publishing.
    pub async fn publish_in(
        &self,
        tx: &mut PgTransaction<'_>,
        event: &TaskEvent,
    ) -> Result<u64, PublishError> {
        let topic = event.kind().topic();
        let payload = event.encode()?;

        let position = self
            .append(&mut **tx, topic, payload)
            .await
            .map_err(|err| PublishError::backend(topic, err))?;

        Ok(position as u64)
    }

    /// Takes the append lock, then inserts. The lock is held until the
    /// surrounding transaction ends.
    async fn append(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query(APPEND_LOCK_SQL)
            .bind(self.table.as_ref())
            .execute(&mut *conn)
            .await?;

        sqlx::query_scalar::<_, i64>(&format!(
            "INSERT INTO {} (topic, payload) VALUES ($1, $2) RETURNING position",
            self.table
        ))
        .bind(topic)
        .bind(payload)
        .fetch_one(&mut *conn)
        .await
    }
}

impl Publisher for OutboxPublisher {
    async fn publish(&self, event: &TaskEvent) -> Result<(), PublishError> {
        let topic = event.kind().topic();
        let payload = event.encode()?;

        let position = async {
            let mut tx = self.pool.begin().await?;
            let position = self.append(&mut tx, topic, payload).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(position)
        }
        .await
        .map_err(|err| PublishError::backend(topic, err))?;

        debug!(topic, task_id = event.task_id(), position, "published task event");
        Ok(())
    }
}

/// Committed position of a consumer group.
#[derive(Clone)]
pub struct OffsetTable {
    pool: PgPool,
    consumer_group: Arc<str>,
    table: Arc<str>,
}

impl OffsetTable {
    pub fn new(pool: PgPool, consumer_group: impl Into<Arc<str>>) -> Self {
        OffsetTable {
            pool,
            consumer_group: consumer_group.into(),
            table: DEFAULT_OFFSETS_TABLE_NAME.into(),
        }
    }

    pub fn table(mut self, table: impl Into<Arc<str>>) -> Self {
        self.table = table.into();
        self
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub async fn load(&self) -> Result<Option<u64>, sqlx::Error> {
        let position = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT position FROM {} WHERE consumer_group = $1",
            self.table,
        ))
        .bind(self.consumer_group.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        Ok(position.map(|pos| pos as u64))
    }

    /// Moves the committed position from `expected_position` to `position`.
    ///
    /// Fails with [`sqlx::Error::RowNotFound`] when another consumer moved the
    /// offset in the meantime, or with a unique violation when a first commit
    /// races another.
    pub async fn save(&self, expected_position: Option<u64>, position: u64) -> Result<(), sqlx::Error> {
        match expected_position {
            None => {
                sqlx::query(&format!(
                    "INSERT INTO {} (consumer_group, position) VALUES ($1, $2)",
                    self.table,
                ))
                .bind(self.consumer_group.as_ref())
                .bind(position as i64)
                .execute(&self.pool)
                .await?;
            }
            Some(expected) => {
                let result = sqlx::query(&format!(
                    "UPDATE {} SET position = $1 WHERE consumer_group = $2 AND position = $3",
                    self.table,
                ))
                .bind(position as i64)
                .bind(self.consumer_group.as_ref())
                .bind(expected as i64)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(sqlx::Error::RowNotFound);
                }
            }
        }

        Ok(())
    }
}

/// Subscribes consumer groups to the outbox table.
#[derive(Clone)]
pub struct OutboxBroker {
    pool: PgPool,
    consumer_group: Arc<str>,
    events_table: Arc<str>,
    offsets_table: Arc<str>,
    batch_size: u32,
}

impl OutboxBroker {
    pub fn new(pool: PgPool, consumer_group: impl Into<Arc<str>>) -> Self {
        OutboxBroker {
            pool,
            consumer_group: consumer_group.into(),
            events_table: DEFAULT_EVENTS_TABLE_NAME.into(),
            offsets_table: DEFAULT_OFFSETS_TABLE_NAME.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn events_table(mut self, table: impl Into<Arc<str>>) -> Self {
        self.events_table = table.into();
        self
    }

    pub fn offsets_table(mut self, table: impl Into<Arc<str>>) -> Self {
        self.offsets_table = table.into();
        self
    }

    /// Rows read per poll.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Creates this broker's tables if they are missing.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        create_tables(&self.pool, &self.events_table, &self.offsets_table).await
    }

    /// A publisher appending to the same outbox table.
    pub fn publisher(&self) -> OutboxPublisher {
        OutboxPublisher::new(self.pool.clone()).table(Arc::clone(&self.events_table))
    }
}

impl EventBroker for OutboxBroker {
    type Source = OutboxSource;

    async fn subscribe(&self, pattern: &str) -> Result<Self::Source, SourceError> {
        let like = like_pattern(pattern)?;
        let offsets = OffsetTable::new(self.pool.clone(), Arc::clone(&self.consumer_group))
            .table(Arc::clone(&self.offsets_table));

        // The lock lives as long as this session, which must not return to the pool.
        let mut lock = self
            .pool
            .acquire()
            .await
            .map_err(SourceError::backend)?
            .detach();
        let acquired = sqlx::query_scalar::<_, bool>(GROUP_LOCK_SQL)
            .bind(format!("{}:{}", self.offsets_table, self.consumer_group))
            .fetch_one(&mut lock)
            .await
            .map_err(SourceError::backend)?;
        if !acquired {
            let _ = lock.close().await;
            return Err(SourceError::GroupBusy {
                group: self.consumer_group.to_string(),
            });
        }

        let committed = match offsets.load().await {
            Ok(committed) => committed,
            Err(err) => {
                let _ = lock.close().await;
                return Err(SourceError::backend(err));
            }
        };

        info!(
            consumer_group = %self.consumer_group,
            committed = ?committed,
            "subscribed to outbox"
        );

        Ok(OutboxSource {
            pool: self.pool.clone(),
            lock,
            events_table: Arc::clone(&self.events_table),
            offsets,
            like,
            batch_size: self.batch_size,
            cursor: committed.unwrap_or(0),
            committed,
            buffered: VecDeque::new(),
        })
    }
}

pub struct OutboxSource {
    pool: PgPool,
    /// Session holding the consumer group lock.
    lock: PgConnection,
    events_table: Arc<str>,
    offsets: OffsetTable,
    like: String,
    batch_size: u32,
    /// Highest position read from the table.
    cursor: u64,
    committed: Option<u64>,
    buffered: VecDeque<Delivery>,
}

impl OutboxSource {
    pub fn committed(&self) -> Option<u64> {
        self.committed
    }

    async fn read_batch(&mut self) -> Result<(), sqlx::Error> {
        let rows = sqlx::query_as::<_, (i64, String, Vec<u8>)>(&format!(
            "SELECT position, topic, payload FROM {} \
             WHERE position > $1 AND topic LIKE $2 ESCAPE '\\' \
             ORDER BY position LIMIT $3",
            self.events_table,
        ))
        .bind(self.cursor as i64)
        .bind(&self.like)
        .bind(i64::from(self.batch_size))
        .fetch_all(&self.pool)
        .await?;

        for (position, topic, payload) in rows {
            let position = position as u64;
            self.cursor = position;
            self.buffered.push_back(Delivery::new(topic, payload).at(position));
        }

        Ok(())
    }
}

impl EventSource for OutboxSource {
    async fn fetch(&mut self, timeout: Duration) -> Result<Fetched, SourceError> {
        if self.buffered.is_empty() {
            self.read_batch().await.map_err(SourceError::backend)?;
        }

        match self.buffered.pop_front() {
            Some(delivery) => Ok(Fetched::Message(delivery)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Fetched::Empty)
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), SourceError> {
        let Some(position) = delivery.position else {
            return Err(SourceError::MissingPosition(delivery.topic.clone()));
        };
        if self.committed.is_some_and(|committed| position <= committed) {
            debug!(position, "position already committed");
            return Ok(());
        }

        match self.offsets.save(self.committed, position).await {
            Ok(()) => {
                self.committed = Some(position);
                return Ok(());
            }
            Err(err) if is_conflict(&err) => {}
            Err(err) => return Err(SourceError::backend(err)),
        }

        let stored = self.offsets.load().await.map_err(SourceError::backend)?;
        warn!(
            consumer_group = self.offsets.consumer_group(),
            local = ?self.committed,
            stored = ?stored,
            "committed offset moved, reloading"
        );
        let covered = self.committed.max(stored).is_some_and(|committed| position <= committed);
        self.committed = stored;
        if covered {
            return Ok(());
        }

        match self.offsets.save(self.committed, position).await {
            Ok(()) => {
                self.committed = Some(position);
                Ok(())
            }
            Err(err) if is_conflict(&err) => Err(SourceError::OffsetConflict {
                group: self.offsets.consumer_group().to_string(),
            }),
            Err(err) => Err(SourceError::backend(err)),
        }
    }

    async fn close(self) -> Result<(), SourceError> {
        // Ending the session releases the consumer group lock.
        self.lock.close().await.map_err(SourceError::backend)?;
        debug!(
            consumer_group = self.offsets.consumer_group(),
            committed = ?self.committed,
            "outbox subscription closed"
        );
        Ok(())
    }
}

fn is_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::RowNotFound => true,
        sqlx::Error::Database(err) => err.is_unique_violation(),
        _ => false,
    }
}

/// Translates a `*` glob into a `LIKE` pattern escaped with `\`.
fn like_pattern(pattern: &str) -> Result<String, SourceError> {
    if pattern.is_empty() {
        return Err(SourceError::InvalidPattern(pattern.to_string()));
    }

    let mut like = String::with_capacity(pattern.len() + 4);
    for c in pattern.chars() {
        match c {
            '*' => like.push('%'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(c);
            }
            c => like.push(c),
        }
    }

    Ok(like)
}
