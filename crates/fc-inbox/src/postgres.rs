//! PostgreSQL storage provider. Same contract and schema shape as
//! the SQLite backend, translated to Postgres dialect: `$N`
//! placeholders, `= ANY($n)` array binding, `BYTEA` payload, `BIGINT`
//! millisecond timestamps, and `FOR UPDATE SKIP LOCKED` on capture.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;

use fc_common::Clock;

use crate::config::RetryPolicy;
use crate::error::Result;
use crate::model::{DeadLetterMessage, HealthMetrics, InboxMessage, NewMessage};
use crate::provider::{ApplyResultsBatch, FifoCapability, MaintenanceCapability, StorageProvider};
use crate::retry::with_retry;

const FIFO_CANDIDATE_FACTOR: u32 = 4;

pub struct PostgresProvider {
    pool: PgPool,
    inbox_name: String,
    is_fifo: bool,
    max_processing_time: Duration,
    enable_dedup: bool,
    deduplication_interval: Duration,
    enable_dead_letter: bool,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl PostgresProvider {
    pub fn new(
        pool: PgPool,
        inbox_name: impl Into<String>,
        is_fifo: bool,
        max_processing_time: Duration,
        enable_dedup: bool,
        deduplication_interval: Duration,
        enable_dead_letter: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            inbox_name: inbox_name.into(),
            is_fifo,
            max_processing_time,
            enable_dedup,
            deduplication_interval,
            enable_dead_letter,
            clock,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Overrides the transient-failure retry policy used by every
    /// storage operation below (default: `RetryPolicy::default()`).
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_messages (
                id TEXT PRIMARY KEY,
                inbox_name TEXT NOT NULL,
                message_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                group_id TEXT,
                collapse_key TEXT,
                deduplication_id TEXT,
                attempts_count INTEGER NOT NULL DEFAULT 0,
                received_at BIGINT NOT NULL,
                captured_at BIGINT,
                captured_by TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_inbox_messages_pending \
             ON inbox_messages (inbox_name, captured_at, received_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_inbox_messages_collapse \
             ON inbox_messages (inbox_name, collapse_key) \
             WHERE captured_at IS NULL AND collapse_key IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_dead_letters (
                id TEXT PRIMARY KEY,
                inbox_name TEXT NOT NULL,
                message_type TEXT NOT NULL,
                payload BYTEA NOT NULL,
                group_id TEXT,
                attempts_count INTEGER NOT NULL,
                received_at BIGINT NOT NULL,
                failure_reason TEXT NOT NULL,
                moved_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_inbox_dead_letters_moved_at \
             ON inbox_dead_letters (inbox_name, moved_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_dedup (
                inbox_name TEXT NOT NULL,
                deduplication_id TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                PRIMARY KEY (inbox_name, deduplication_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_inbox_dedup_created_at \
             ON inbox_dedup (inbox_name, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_group_locks (
                inbox_name TEXT NOT NULL,
                group_id TEXT NOT NULL,
                locked_at BIGINT,
                locked_by TEXT,
                PRIMARY KEY (inbox_name, group_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_inbox_group_locks_locked_at \
             ON inbox_group_locks (inbox_name, locked_at)",
        )
        .execute(&self.pool)
        .await?;

        info!(inbox = %self.inbox_name, "PostgreSQL inbox schema initialized");
        Ok(())
    }

    fn lease_cutoff_ms(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis() - self.max_processing_time.as_millis() as i64
    }

    fn parse_row(row: &PgRow) -> Result<InboxMessage> {
        let received_at_ms: i64 = row.get("received_at");
        let captured_at_ms: Option<i64> = row.get("captured_at");
        Ok(InboxMessage {
            id: row.get("id"),
            inbox_name: row.get("inbox_name"),
            message_type: row.get("message_type"),
            payload: row.get("payload"),
            group_id: row.get("group_id"),
            collapse_key: row.get("collapse_key"),
            deduplication_id: row.get("deduplication_id"),
            attempts_count: row.get::<i32, _>("attempts_count") as u32,
            received_at: DateTime::from_timestamp_millis(received_at_ms).unwrap_or_else(Utc::now),
            captured_at: captured_at_ms.and_then(DateTime::from_timestamp_millis),
            captured_by: row.get("captured_by"),
        })
    }

    async fn write_batch_once(&self, messages: Vec<NewMessage>) -> Result<()> {
            if messages.is_empty() {
                return Ok(());
            }
            let now = self.clock.now_utc();
            let now_ms = now.timestamp_millis();
            let mut tx = self.pool.begin().await?;
    
            for message in messages {
                if let Some(existing_id) = &message.id {
                    let exists: Option<(String,)> =
                        sqlx::query_as("SELECT id FROM inbox_messages WHERE inbox_name = $1 AND id = $2")
                            .bind(&self.inbox_name)
                            .bind(existing_id)
                            .fetch_optional(&mut *tx)
                            .await?;
                    if exists.is_some() {
                        continue;
                    }
                }
    
                if self.enable_dedup {
                    if let Some(dedup_id) = &message.deduplication_id {
                        let row: Option<(i64,)> = sqlx::query_as(
                            "SELECT created_at FROM inbox_dedup WHERE inbox_name = $1 AND deduplication_id = $2",
                        )
                        .bind(&self.inbox_name)
                        .bind(dedup_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                        if let Some((created_at_ms,)) = row {
                            let age = now_ms - created_at_ms;
                            if age < self.deduplication_interval.as_millis() as i64 {
                                continue;
                            }
                        }
                    }
                }
    
                if let Some(collapse_key) = &message.collapse_key {
                    sqlx::query(
                        "DELETE FROM inbox_messages \
                         WHERE inbox_name = $1 AND collapse_key = $2 AND captured_at IS NULL",
                    )
                    .bind(&self.inbox_name)
                    .bind(collapse_key)
                    .execute(&mut *tx)
                    .await?;
                }
    
                let dedup_id = message.deduplication_id.clone();
                let inbox_message = message.into_message(&self.inbox_name, now);
    
                sqlx::query(
                    r#"
                    INSERT INTO inbox_messages
                        (id, inbox_name, message_type, payload, group_id, collapse_key, deduplication_id,
                         attempts_count, received_at, captured_at, captured_by)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, NULL, NULL)
                    "#,
                )
                .bind(&inbox_message.id)
                .bind(&inbox_message.inbox_name)
                .bind(&inbox_message.message_type)
                .bind(&inbox_message.payload)
                .bind(&inbox_message.group_id)
                .bind(&inbox_message.collapse_key)
                .bind(&inbox_message.deduplication_id)
                .bind(inbox_message.received_at.timestamp_millis())
                .execute(&mut *tx)
                .await?;
    
                if self.enable_dedup {
                    if let Some(dedup_id) = dedup_id {
                        sqlx::query(
                            "INSERT INTO inbox_dedup (inbox_name, deduplication_id, created_at) VALUES ($1, $2, $3) \
                             ON CONFLICT (inbox_name, deduplication_id) DO UPDATE SET created_at = excluded.created_at",
                        )
                        .bind(&self.inbox_name)
                        .bind(&dedup_id)
                        .bind(now_ms)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
    
            tx.commit().await?;
            Ok(())
        }

    async fn read_and_capture_once(&self, worker_id: &str, read_batch_size: u32) -> Result<Vec<InboxMessage>> {
            let now = self.clock.now_utc();
            let cutoff = self.lease_cutoff_ms(now);
            let fetch_limit = if self.is_fifo { read_batch_size.saturating_mul(FIFO_CANDIDATE_FACTOR) } else { read_batch_size };
    
            let mut tx = self.pool.begin().await?;
    
            let rows = sqlx::query(
                "SELECT id, inbox_name, message_type, payload, group_id, collapse_key, deduplication_id, \
                        attempts_count, received_at, captured_at, captured_by \
                 FROM inbox_messages \
                 WHERE inbox_name = $1 AND (captured_at IS NULL OR captured_at <= $2) \
                 ORDER BY received_at ASC \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(&self.inbox_name)
            .bind(cutoff)
            .bind(fetch_limit as i64)
            .fetch_all(&mut *tx)
            .await?;
    
            let mut candidates = Vec::with_capacity(rows.len());
            for row in &rows {
                candidates.push(Self::parse_row(row)?);
            }
    
            let mut selected: Vec<InboxMessage> = Vec::new();
            let mut groups_acquired: Vec<String> = Vec::new();

            if self.is_fifo {
                // Serialize the acquire-decision for each candidate group across
                // concurrently-running transactions: a session-level `FOR UPDATE`
                // on `inbox_group_locks` can't block on a row that doesn't exist
                // yet, so take a transaction-scoped advisory lock keyed on the
                // group id instead. Held until commit/rollback, so a second
                // transaction racing on the same group blocks here until the
                // first has committed its lock row.
                let mut candidate_group_ids: Vec<String> =
                    candidates.iter().filter_map(|m| m.group_id.clone()).collect();
                candidate_group_ids.sort();
                candidate_group_ids.dedup();
                for group_id in &candidate_group_ids {
                    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                        .bind(group_id)
                        .execute(&mut *tx)
                        .await?;
                }

                let lock_rows = sqlx::query(
                    "SELECT group_id, locked_at, locked_by FROM inbox_group_locks WHERE inbox_name = $1",
                )
                .bind(&self.inbox_name)
                .fetch_all(&mut *tx)
                .await?;

                for message in candidates {
                    if selected.len() >= read_batch_size as usize {
                        break;
                    }
                    let Some(group_id) = message.group_id.clone() else {
                        selected.push(message);
                        continue;
                    };
                    if groups_acquired.contains(&group_id) {
                        selected.push(message);
                        continue;
                    }
                    let locked_by_other = lock_rows.iter().any(|row| {
                        let locked_group: String = row.get("group_id");
                        if locked_group != group_id {
                            return false;
                        }
                        let locked_by: Option<String> = row.get("locked_by");
                        let locked_at_ms: Option<i64> = row.get("locked_at");
                        match (locked_by, locked_at_ms) {
                            (Some(by), Some(at)) => by != worker_id && at > cutoff,
                            _ => false,
                        }
                    });
                    if locked_by_other {
                        continue;
                    }
                    groups_acquired.push(group_id);
                    selected.push(message);
                }
            } else {
                selected = candidates.into_iter().take(read_batch_size as usize).collect();
            }
    
            if selected.is_empty() {
                tx.commit().await?;
                return Ok(Vec::new());
            }
    
            let now_ms = now.timestamp_millis();
            let selected_ids: Vec<String> = selected.iter().map(|m| m.id.clone()).collect();
            sqlx::query("UPDATE inbox_messages SET captured_at = $1, captured_by = $2 WHERE id = ANY($3)")
                .bind(now_ms)
                .bind(worker_id)
                .bind(&selected_ids)
                .execute(&mut *tx)
                .await?;
            for message in selected.iter_mut() {
                message.captured_at = Some(now);
                message.captured_by = Some(worker_id.to_string());
            }
    
            for group_id in &groups_acquired {
                sqlx::query(
                    "INSERT INTO inbox_group_locks (inbox_name, group_id, locked_at, locked_by) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (inbox_name, group_id) DO UPDATE SET locked_at = excluded.locked_at, locked_by = excluded.locked_by",
                )
                .bind(&self.inbox_name)
                .bind(group_id)
                .bind(now_ms)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
            }
    
            tx.commit().await?;
            Ok(selected)
        }

    async fn extend_locks_once(&self, worker_id: &str, message_ids: &[String], new_captured_at: DateTime<Utc>) -> Result<u64> {
            if message_ids.is_empty() {
                return Ok(0);
            }
            let new_ms = new_captured_at.timestamp_millis();
            let mut tx = self.pool.begin().await?;
    
            let group_rows: Vec<(Option<String>,)> = sqlx::query_as(
                "SELECT group_id FROM inbox_messages \
                 WHERE id = ANY($1) AND inbox_name = $2 AND captured_by = $3 AND captured_at IS NOT NULL",
            )
            .bind(message_ids)
            .bind(&self.inbox_name)
            .bind(worker_id)
            .fetch_all(&mut *tx)
            .await?;
    
            let result = sqlx::query(
                "UPDATE inbox_messages SET captured_at = $1 \
                 WHERE id = ANY($2) AND inbox_name = $3 AND captured_by = $4 AND captured_at IS NOT NULL",
            )
            .bind(new_ms)
            .bind(message_ids)
            .bind(&self.inbox_name)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;
    
            let mut groups_to_refresh: Vec<String> = Vec::new();
            for (group_id,) in group_rows {
                if let Some(group_id) = group_id {
                    if !groups_to_refresh.contains(&group_id) {
                        groups_to_refresh.push(group_id);
                    }
                }
            }
    
            for group_id in groups_to_refresh {
                sqlx::query(
                    "UPDATE inbox_group_locks SET locked_at = $1 \
                     WHERE inbox_name = $2 AND group_id = $3 AND locked_by = $4",
                )
                .bind(new_ms)
                .bind(&self.inbox_name)
                .bind(&group_id)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
            }
    
            tx.commit().await?;
            Ok(result.rows_affected())
        }

    async fn apply_results_once(&self, batch: ApplyResultsBatch) -> Result<()> {
            if batch.is_empty() {
                return Ok(());
            }
            let now = self.clock.now_utc();
            let mut tx = self.pool.begin().await?;
    
            if !batch.to_complete.is_empty() {
                sqlx::query("DELETE FROM inbox_messages WHERE id = ANY($1) AND inbox_name = $2")
                    .bind(&batch.to_complete)
                    .bind(&self.inbox_name)
                    .execute(&mut *tx)
                    .await?;
            }
    
            if !batch.to_fail.is_empty() {
                sqlx::query(
                    "UPDATE inbox_messages SET captured_at = NULL, captured_by = NULL, \
                     attempts_count = attempts_count + 1 WHERE id = ANY($1) AND inbox_name = $2",
                )
                .bind(&batch.to_fail)
                .bind(&self.inbox_name)
                .execute(&mut *tx)
                .await?;
            }
    
            if !batch.to_release.is_empty() {
                sqlx::query(
                    "UPDATE inbox_messages SET captured_at = NULL, captured_by = NULL \
                     WHERE id = ANY($1) AND inbox_name = $2",
                )
                .bind(&batch.to_release)
                .bind(&self.inbox_name)
                .execute(&mut *tx)
                .await?;
            }
    
            for entry in &batch.to_dead_letter {
                let row = sqlx::query(
                    "SELECT id, inbox_name, message_type, payload, group_id, attempts_count, received_at \
                     FROM inbox_messages WHERE id = $1 AND inbox_name = $2",
                )
                .bind(&entry.id)
                .bind(&self.inbox_name)
                .fetch_optional(&mut *tx)
                .await?;
    
                let Some(row) = row else { continue };
    
                if self.enable_dead_letter {
                    let message_type: String = row.get("message_type");
                    let payload: Vec<u8> = row.get("payload");
                    let group_id: Option<String> = row.get("group_id");
                    let attempts_count: i32 = row.get("attempts_count");
                    let received_at: i64 = row.get("received_at");
    
                    sqlx::query(
                        r#"
                        INSERT INTO inbox_dead_letters
                            (id, inbox_name, message_type, payload, group_id, attempts_count,
                             received_at, failure_reason, moved_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        "#,
                    )
                    .bind(&entry.id)
                    .bind(&self.inbox_name)
                    .bind(message_type)
                    .bind(payload)
                    .bind(group_id)
                    .bind(attempts_count)
                    .bind(received_at)
                    .bind(&entry.reason)
                    .bind(now.timestamp_millis())
                    .execute(&mut *tx)
                    .await?;
                }
    
                sqlx::query("DELETE FROM inbox_messages WHERE id = $1 AND inbox_name = $2")
                    .bind(&entry.id)
                    .bind(&self.inbox_name)
                    .execute(&mut *tx)
                    .await?;
            }
    
            tx.commit().await?;
            Ok(())
        }

}

#[async_trait]
impl StorageProvider for PostgresProvider {
    async fn write(&self, message: NewMessage) -> Result<()> {
        self.write_batch(vec![message]).await
    }

    async fn write_batch(&self, messages: Vec<NewMessage>) -> Result<()> {
        with_retry(&self.retry_policy, || self.write_batch_once(messages.clone())).await
    }

    async fn read_and_capture(&self, worker_id: &str, read_batch_size: u32) -> Result<Vec<InboxMessage>> {
        with_retry(&self.retry_policy, || self.read_and_capture_once(worker_id, read_batch_size)).await
    }

    async fn extend_locks(
        &self,
        worker_id: &str,
        message_ids: &[String],
        new_captured_at: DateTime<Utc>,
    ) -> Result<u64> {
        with_retry(&self.retry_policy, || self.extend_locks_once(worker_id, message_ids, new_captured_at)).await
    }

    async fn apply_results(&self, batch: ApplyResultsBatch) -> Result<()> {
        with_retry(&self.retry_policy, || self.apply_results_once(batch.clone())).await
    }

    async fn read_dead_letters(&self, max: u32) -> Result<Vec<DeadLetterMessage>> {
        if !self.enable_dead_letter {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, inbox_name, message_type, payload, group_id, attempts_count, received_at, \
                    failure_reason, moved_at \
             FROM inbox_dead_letters WHERE inbox_name = $1 ORDER BY moved_at ASC LIMIT $2",
        )
        .bind(&self.inbox_name)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let received_at_ms: i64 = row.get("received_at");
            let moved_at_ms: i64 = row.get("moved_at");
            records.push(DeadLetterMessage {
                id: row.get("id"),
                inbox_name: row.get("inbox_name"),
                message_type: row.get("message_type"),
                payload: row.get("payload"),
                group_id: row.get("group_id"),
                attempts_count: row.get::<i32, _>("attempts_count") as u32,
                received_at: DateTime::from_timestamp_millis(received_at_ms).unwrap_or_else(Utc::now),
                failure_reason: row.get("failure_reason"),
                moved_at: DateTime::from_timestamp_millis(moved_at_ms).unwrap_or_else(Utc::now),
            });
        }
        Ok(records)
    }

    async fn cleanup_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM inbox_dead_letters WHERE inbox_name = $1 AND moved_at <= $2")
            .bind(&self.inbox_name)
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_dedup_records(&self, cutoff: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM inbox_dedup WHERE (inbox_name, deduplication_id) IN ( \
                SELECT inbox_name, deduplication_id FROM inbox_dedup \
                WHERE inbox_name = $1 AND created_at <= $2 LIMIT $3 \
             )",
        )
        .bind(&self.inbox_name)
        .bind(cutoff.timestamp_millis())
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn fifo_capability(&self) -> Option<&dyn FifoCapability> {
        if self.is_fifo {
            Some(self)
        } else {
            None
        }
    }

    fn maintenance_capability(&self) -> Option<&dyn MaintenanceCapability> {
        Some(self)
    }
}

#[async_trait]
impl FifoCapability for PostgresProvider {
    async fn release_group_locks(&self, group_ids: &[String]) -> Result<()> {
        if group_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE inbox_group_locks SET locked_at = NULL, locked_by = NULL \
             WHERE inbox_name = $1 AND group_id = ANY($2)",
        )
        .bind(&self.inbox_name)
        .bind(group_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_messages_and_group_locks(&self, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        let group_rows: Vec<(Option<String>,)> = sqlx::query_as(
            "SELECT group_id FROM inbox_messages WHERE id = ANY($1) AND inbox_name = $2",
        )
        .bind(message_ids)
        .bind(&self.inbox_name)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE inbox_messages SET captured_at = NULL, captured_by = NULL \
             WHERE id = ANY($1) AND inbox_name = $2",
        )
        .bind(message_ids)
        .bind(&self.inbox_name)
        .execute(&mut *tx)
        .await?;

        let mut group_ids: Vec<String> = Vec::new();
        for (group_id,) in group_rows {
            if let Some(group_id) = group_id {
                if !group_ids.contains(&group_id) {
                    group_ids.push(group_id);
                }
            }
        }

        if !group_ids.is_empty() {
            sqlx::query(
                "UPDATE inbox_group_locks SET locked_at = NULL, locked_by = NULL \
                 WHERE inbox_name = $1 AND group_id = ANY($2)",
            )
            .bind(&self.inbox_name)
            .bind(&group_ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn cleanup_expired_group_locks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE inbox_group_locks SET locked_at = NULL, locked_by = NULL \
             WHERE inbox_name = $1 AND locked_at IS NOT NULL AND locked_at <= $2",
        )
        .bind(&self.inbox_name)
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MaintenanceCapability for PostgresProvider {
    async fn migrate(&self) -> Result<()> {
        self.init_schema().await
    }

    async fn health_metrics(&self) -> Result<HealthMetrics> {
        let pending_count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM inbox_messages WHERE inbox_name = $1 AND captured_at IS NULL",
        )
        .bind(&self.inbox_name)
        .fetch_one(&self.pool)
        .await?;

        let captured_count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM inbox_messages WHERE inbox_name = $1 AND captured_at IS NOT NULL",
        )
        .bind(&self.inbox_name)
        .fetch_one(&self.pool)
        .await?;

        let dead_letter_count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM inbox_dead_letters WHERE inbox_name = $1",
        )
        .bind(&self.inbox_name)
        .fetch_one(&self.pool)
        .await?;

        let oldest: (Option<i64>,) = sqlx::query_as(
            "SELECT MIN(received_at) FROM inbox_messages WHERE inbox_name = $1 AND captured_at IS NULL",
        )
        .bind(&self.inbox_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(HealthMetrics {
            pending_count: pending_count.0 as u64,
            captured_count: captured_count.0 as u64,
            dead_letter_count: dead_letter_count.0 as u64,
            oldest_pending_at: oldest.0.and_then(DateTime::from_timestamp_millis),
        })
    }
}
