//! SQLite-backed [`MessageStore`].
//!
//! Lease acquisition is a single conditional `UPDATE ... RETURNING`. Every
//! other mutation reads the row, runs the state-machine transition from
//! [`crate::message`] and writes the result back with a compare-and-swap on
//! the row's `version`. A lost swap re-reads and re-runs the transition, so
//! concurrent writers always see each other's effects.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound as _, TimeDelta, Utc};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    types::Json,
    FromRow, SqlitePool,
};

use super::{apply_failure, apply_success, generate_lease_token, Lease, MessageStore, StoreFuture};
use crate::{
    clock::Clock,
    config::Config,
    error::Error,
    message::{Message, MessageId, MessageKind, MessageStatus, NewMessage, Payload},
    policy::BackoffPolicy,
};

/// Attempts at a compare-and-swap write before giving up with a conflict.
const MAX_SWAP_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    policy: BackoffPolicy,
    lease_timeout: TimeDelta,
    clock: Arc<dyn Clock>,
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    kind: MessageKind,
    status: MessageStatus,
    retry_count: i64,
    max_retries: i64,
    created_at: i64,
    last_attempt_at: Option<i64>,
    next_eligible_at: Option<i64>,
    last_error: Option<String>,
    payload: Json<Payload>,
    lease_token: Option<String>,
    lease_expires_at: Option<i64>,
    version: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: MessageId(row.id),
            kind: row.kind,
            status: row.status,
            retry_count: u32::try_from(row.retry_count).map_err(Error::internal)?,
            max_retries: u32::try_from(row.max_retries).map_err(Error::internal)?,
            created_at: from_millis(row.created_at)?,
            last_attempt_at: row.last_attempt_at.map(from_millis).transpose()?,
            next_eligible_at: row.next_eligible_at.map(from_millis).transpose()?,
            last_error: row.last_error,
            payload: row.payload.0,
            leased_until: row.lease_expires_at.map(from_millis).transpose()?,
            lease_token: row.lease_token,
            version: row.version,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::internal(eyre::eyre!("timestamp out of range: {ms}")))
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, Error> {
    rows.into_iter().map(Message::try_from).collect()
}

impl SqliteStore {
    /// Opens (or creates) the database named by the config and runs migrations.
    pub async fn connect(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let in_memory = config.db_path() == ":memory:";

        let opts = if in_memory {
            SqliteConnectOptions::new().in_memory(true).shared_cache(true)
        } else {
            SqliteConnectOptions::new()
                .filename(config.db_path())
                .create_if_missing(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        // An in-memory database lives exactly as long as its connection.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = pool_opts.connect_with(opts).await?;

        Self::new(pool, config.backoff_policy()?, config.lease_delta()?, clock).await
    }

    pub async fn new(
        pool: SqlitePool,
        policy: BackoffPolicy,
        lease_timeout: TimeDelta,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            policy,
            lease_timeout,
            clock,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, id: MessageId) -> Result<Option<Message>, Error> {
        sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Message::try_from)
            .transpose()
    }

    /// Writes `message` back if nobody else has written the row since it was read.
    async fn compare_and_swap(&self, message: &Message) -> Result<bool, Error> {
        let result = sqlx::query(
            "
            UPDATE messages
            SET status = $1,
                retry_count = $2,
                max_retries = $3,
                last_attempt_at = $4,
                next_eligible_at = $5,
                last_error = $6,
                lease_token = $7,
                lease_expires_at = $8,
                version = version + 1
            WHERE id = $9 AND version = $10
            ",
        )
        .bind(message.status)
        .bind(i64::from(message.retry_count))
        .bind(i64::from(message.max_retries))
        .bind(message.last_attempt_at.map(to_millis))
        .bind(message.next_eligible_at.map(to_millis))
        .bind(message.last_error.as_deref())
        .bind(message.lease_token.as_deref())
        .bind(message.leased_until.map(to_millis))
        .bind(message.id)
        .bind(message.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Read, transition, compare-and-swap; retried when the swap loses a race.
    ///
    /// `f` reports whether it changed the message; unchanged messages are not written.
    async fn transition<F>(&self, id: MessageId, f: F) -> Result<Message, Error>
    where
        F: Fn(&mut Message, DateTime<Utc>) -> Result<bool, Error> + Send + Sync,
    {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let mut message = self
                .fetch(id)
                .await?
                .ok_or_else(|| Error::message_not_found(id))?;

            // Rows hold milliseconds; keep the returned message identical to what's stored.
            let now = self.clock.now().trunc_subsecs(3);
            if !f(&mut message, now)? {
                return Ok(message);
            }

            if self.compare_and_swap(&message).await? {
                message.version += 1;
                return Ok(message);
            }

            tracing::debug!(%id, "message changed underneath us, retrying transition");
        }

        Err(Error::conflict(format!(
            "message {id} is being modified concurrently"
        )))
    }
}

impl MessageStore for SqliteStore {
    fn insert(&self, new: NewMessage) -> StoreFuture<'_, Message> {
        Box::pin(async move {
            let draft = Message::new(
                MessageId(0),
                new,
                self.policy.default_max_retries(),
                self.clock.now(),
            )?;

            let row: MessageRow = sqlx::query_as(
                "
                INSERT INTO messages (kind, status, retry_count, max_retries, created_at, payload)
                VALUES ($1, $2, 0, $3, $4, $5)
                RETURNING *
                ",
            )
            .bind(draft.kind)
            .bind(draft.status)
            .bind(i64::from(draft.max_retries))
            .bind(to_millis(draft.created_at))
            .bind(Json(&draft.payload))
            .fetch_one(&self.pool)
            .await?;

            row.try_into()
        })
    }

    fn get(&self, id: MessageId) -> StoreFuture<'_, Option<Message>> {
        Box::pin(self.fetch(id))
    }

    fn list(&self, status: Option<MessageStatus>, limit: u32) -> StoreFuture<'_, Vec<Message>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(
                "
                SELECT * FROM messages
                WHERE $1 IS NULL OR status = $1
                ORDER BY id DESC
                LIMIT $2
                ",
            )
            .bind(status)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

            into_messages(rows)
        })
    }

    fn select_eligible_failed(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreFuture<'_, Vec<Message>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(
                "
                SELECT * FROM messages
                WHERE status = $1
                  AND next_eligible_at <= $2
                  AND (lease_token IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $2)
                ORDER BY next_eligible_at ASC, id ASC
                LIMIT $3
                ",
            )
            .bind(MessageStatus::Failed)
            .bind(to_millis(now))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

            into_messages(rows)
        })
    }

    fn try_acquire(&self, id: MessageId) -> StoreFuture<'_, Option<Lease>> {
        Box::pin(async move {
            let now = self.clock.now();
            let token = generate_lease_token();

            let row: Option<MessageRow> = sqlx::query_as(
                "
                UPDATE messages
                SET lease_token = $1,
                    lease_expires_at = $2,
                    version = version + 1
                WHERE id = $3
                  AND status IN ($4, $5)
                  AND (lease_token IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $6)
                RETURNING *
                ",
            )
            .bind(&token)
            .bind(to_millis(now + self.lease_timeout))
            .bind(id)
            .bind(MessageStatus::Pending)
            .bind(MessageStatus::Failed)
            .bind(to_millis(now))
            .fetch_optional(&self.pool)
            .await?;

            row.map(|row| Message::try_from(row).map(|message| Lease::new(message, token)))
                .transpose()
        })
    }

    fn record_success<'a>(&'a self, lease: &'a Lease) -> StoreFuture<'a, Message> {
        Box::pin(self.transition(lease.id(), move |message, now| {
            apply_success(message, lease, now)
        }))
    }

    fn record_failure<'a>(
        &'a self,
        lease: &'a Lease,
        error: &'a str,
    ) -> StoreFuture<'a, Message> {
        Box::pin(self.transition(lease.id(), move |message, now| {
            apply_failure(message, lease, &self.policy, error, now)?;
            Ok(true)
        }))
    }

    fn force_retry(&self, id: MessageId) -> StoreFuture<'_, Message> {
        Box::pin(self.transition(id, |message, now| {
            message.force_retry(now)?;
            Ok(true)
        }))
    }

    fn reject(&self, id: MessageId) -> StoreFuture<'_, Message> {
        Box::pin(self.transition(id, |message, now| message.reject(now)))
    }
}
