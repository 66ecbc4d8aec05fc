//! Redis storage provider. Sorted sets carry ordering (`pending`
//! scored by `received_at`, `captured` scored by `captured_at`), one
//! hash per message holds the row, and a `group:{id}` key with a
//! `PX`-style TTL stands in for the durable group-locks table. Multi-step
//! operations run as `redis::Script` Lua, the same atomic
//! check-and-mutate pattern a leader-election implementation would use
//! for its lock key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use fc_common::Clock;

use crate::error::Result;
use crate::model::{DeadLetterMessage, HealthMetrics, InboxMessage, NewMessage};
use crate::provider::{ApplyResultsBatch, FifoCapability, MaintenanceCapability, StorageProvider};

const FIFO_CANDIDATE_FACTOR: isize = 4;

const WRITE_BATCH_SCRIPT: &str = r#"
local prefix = ARGV[1]
local enable_dedup = ARGV[2]
local dedup_ttl_seconds = ARGV[3]
local n = tonumber(ARGV[4])
local pending_key = KEYS[1]
local idx = 5
local written = 0

for _ = 1, n do
    local id = ARGV[idx]
    local message_type = ARGV[idx + 1]
    local payload = ARGV[idx + 2]
    local group_id = ARGV[idx + 3]
    local collapse_key = ARGV[idx + 4]
    local dedup_id = ARGV[idx + 5]
    local received_at = ARGV[idx + 6]
    idx = idx + 7

    local msg_key = prefix .. ":msg:" .. id
    local skip = false

    if redis.call("EXISTS", msg_key) == 1 then
        skip = true
    end

    if not skip and enable_dedup == "1" and dedup_id ~= "" then
        local dedup_key = prefix .. ":dedup:" .. dedup_id
        if redis.call("EXISTS", dedup_key) == 1 then
            skip = true
        end
    end

    if not skip then
        if collapse_key ~= "" then
            local coll_key = prefix .. ":collapse:" .. collapse_key
            local old_id = redis.call("GET", coll_key)
            if old_id then
                local old_msg_key = prefix .. ":msg:" .. old_id
                local captured_by = redis.call("HGET", old_msg_key, "captured_by")
                if (not captured_by) or captured_by == "" then
                    redis.call("ZREM", pending_key, old_id)
                    redis.call("DEL", old_msg_key)
                end
            end
            redis.call("SET", coll_key, id)
        end

        redis.call("HSET", msg_key,
            "id", id,
            "message_type", message_type,
            "payload", payload,
            "group_id", group_id,
            "collapse_key", collapse_key,
            "deduplication_id", dedup_id,
            "attempts_count", "0",
            "received_at", received_at,
            "captured_at", "",
            "captured_by", "")
        redis.call("ZADD", pending_key, received_at, id)

        if enable_dedup == "1" and dedup_id ~= "" then
            local dedup_key = prefix .. ":dedup:" .. dedup_id
            redis.call("SETEX", dedup_key, dedup_ttl_seconds, "1")
        end

        written = written + 1
    end
end

return written
"#;

const READ_AND_CAPTURE_SCRIPT: &str = r#"
local prefix = ARGV[1]
local now_ms = ARGV[2]
local cutoff_ms = tonumber(ARGV[3])
local fetch_limit = tonumber(ARGV[4])
local read_batch_size = tonumber(ARGV[5])
local worker_id = ARGV[6]
local is_fifo = ARGV[7]
local max_processing_ms = ARGV[8]

local pending_key = KEYS[1]
local captured_key = KEYS[2]

local expired = redis.call("ZRANGEBYSCORE", captured_key, "-inf", cutoff_ms)
for _, id in ipairs(expired) do
    local msg_key = prefix .. ":msg:" .. id
    redis.call("ZREM", captured_key, id)
    if redis.call("EXISTS", msg_key) == 1 then
        local received_at = redis.call("HGET", msg_key, "received_at")
        redis.call("HSET", msg_key, "captured_at", "", "captured_by", "")
        redis.call("ZADD", pending_key, received_at, id)
    end
end

local candidates = redis.call("ZRANGE", pending_key, 0, fetch_limit - 1)
local selected = {}
local groups_acquired = {}

for _, id in ipairs(candidates) do
    if #selected < read_batch_size then
        local msg_key = prefix .. ":msg:" .. id
        local group_id = redis.call("HGET", msg_key, "group_id")
        local eligible = true
        if is_fifo == "1" and group_id and group_id ~= "" then
            local already = false
            for _, g in ipairs(groups_acquired) do
                if g == group_id then already = true end
            end
            if not already then
                local gkey = prefix .. ":group:" .. group_id
                local locked_by = redis.call("GET", gkey)
                if locked_by and locked_by ~= worker_id then
                    eligible = false
                else
                    table.insert(groups_acquired, group_id)
                end
            end
        end
        if eligible then
            table.insert(selected, id)
        end
    end
end

for _, id in ipairs(selected) do
    local msg_key = prefix .. ":msg:" .. id
    redis.call("ZREM", pending_key, id)
    redis.call("ZADD", captured_key, now_ms, id)
    redis.call("HSET", msg_key, "captured_at", now_ms, "captured_by", worker_id)
end

for _, group_id in ipairs(groups_acquired) do
    local gkey = prefix .. ":group:" .. group_id
    redis.call("SET", gkey, worker_id, "PX", max_processing_ms)
end

return selected
"#;

const EXTEND_LOCKS_SCRIPT: &str = r#"
local prefix = ARGV[1]
local worker_id = ARGV[2]
local new_ms = ARGV[3]
local max_ms = ARGV[4]
local captured_key = KEYS[1]
local extended = 0
local groups = {}

for i = 5, #ARGV do
    local id = ARGV[i]
    local msg_key = prefix .. ":msg:" .. id
    local captured_by = redis.call("HGET", msg_key, "captured_by")
    if captured_by == worker_id then
        redis.call("HSET", msg_key, "captured_at", new_ms)
        redis.call("ZADD", captured_key, new_ms, id)
        extended = extended + 1
        local group_id = redis.call("HGET", msg_key, "group_id")
        if group_id and group_id ~= "" then
            local already = false
            for _, g in ipairs(groups) do
                if g == group_id then already = true end
            end
            if not already then table.insert(groups, group_id) end
        end
    end
end

for _, group_id in ipairs(groups) do
    local gkey = prefix .. ":group:" .. group_id
    local locked_by = redis.call("GET", gkey)
    if locked_by == worker_id then
        redis.call("PEXPIRE", gkey, max_ms)
    end
end

return extended
"#;

const APPLY_RESULTS_SCRIPT: &str = r#"
local prefix = ARGV[1]
local now_ms = ARGV[2]
local enable_dead_letter = ARGV[3]
local pending_key = KEYS[1]
local captured_key = KEYS[2]
local dlq_key = prefix .. ":dlq"
local idx = 4

local function read_ids(count)
    local out = {}
    for i = 1, count do
        out[i] = ARGV[idx]
        idx = idx + 1
    end
    return out
end

local n_complete = tonumber(ARGV[idx]); idx = idx + 1
local complete_ids = read_ids(n_complete)
local n_fail = tonumber(ARGV[idx]); idx = idx + 1
local fail_ids = read_ids(n_fail)
local n_release = tonumber(ARGV[idx]); idx = idx + 1
local release_ids = read_ids(n_release)
local n_dl = tonumber(ARGV[idx]); idx = idx + 1
local dl_ids = {}
local dl_reasons = {}
for i = 1, n_dl do
    dl_ids[i] = ARGV[idx]; idx = idx + 1
    dl_reasons[i] = ARGV[idx]; idx = idx + 1
end

for _, id in ipairs(complete_ids) do
    local msg_key = prefix .. ":msg:" .. id
    local collapse_key = redis.call("HGET", msg_key, "collapse_key")
    redis.call("ZREM", pending_key, id)
    redis.call("ZREM", captured_key, id)
    redis.call("DEL", msg_key)
    if collapse_key and collapse_key ~= "" then
        local coll_key = prefix .. ":collapse:" .. collapse_key
        if redis.call("GET", coll_key) == id then
            redis.call("DEL", coll_key)
        end
    end
end

for _, id in ipairs(fail_ids) do
    local msg_key = prefix .. ":msg:" .. id
    if redis.call("EXISTS", msg_key) == 1 then
        local received_at = redis.call("HGET", msg_key, "received_at")
        redis.call("HSET", msg_key, "captured_at", "", "captured_by", "")
        redis.call("HINCRBY", msg_key, "attempts_count", 1)
        redis.call("ZREM", captured_key, id)
        redis.call("ZADD", pending_key, received_at, id)
    end
end

for _, id in ipairs(release_ids) do
    local msg_key = prefix .. ":msg:" .. id
    if redis.call("EXISTS", msg_key) == 1 then
        local received_at = redis.call("HGET", msg_key, "received_at")
        redis.call("HSET", msg_key, "captured_at", "", "captured_by", "")
        redis.call("ZREM", captured_key, id)
        redis.call("ZADD", pending_key, received_at, id)
    end
end

for i, id in ipairs(dl_ids) do
    local msg_key = prefix .. ":msg:" .. id
    if redis.call("EXISTS", msg_key) == 1 then
        if enable_dead_letter == "1" then
            local dlq_msg_key = prefix .. ":dlqmsg:" .. id
            redis.call("HSET", dlq_msg_key,
                "id", id,
                "message_type", redis.call("HGET", msg_key, "message_type"),
                "payload", redis.call("HGET", msg_key, "payload"),
                "group_id", redis.call("HGET", msg_key, "group_id"),
                "attempts_count", redis.call("HGET", msg_key, "attempts_count"),
                "received_at", redis.call("HGET", msg_key, "received_at"),
                "failure_reason", dl_reasons[i],
                "moved_at", now_ms)
            redis.call("ZADD", dlq_key, now_ms, id)
        end
        redis.call("ZREM", pending_key, id)
        redis.call("ZREM", captured_key, id)
        redis.call("DEL", msg_key)
    end
end

return 1
"#;

const RELEASE_MESSAGES_AND_GROUP_LOCKS_SCRIPT: &str = r#"
local prefix = ARGV[1]
local pending_key = KEYS[1]
local captured_key = KEYS[2]
local groups = {}

for i = 2, #ARGV do
    local id = ARGV[i]
    local msg_key = prefix .. ":msg:" .. id
    if redis.call("EXISTS", msg_key) == 1 then
        local received_at = redis.call("HGET", msg_key, "received_at")
        local group_id = redis.call("HGET", msg_key, "group_id")
        redis.call("HSET", msg_key, "captured_at", "", "captured_by", "")
        redis.call("ZREM", captured_key, id)
        redis.call("ZADD", pending_key, received_at, id)
        if group_id and group_id ~= "" then
            local already = false
            for _, g in ipairs(groups) do
                if g == group_id then already = true end
            end
            if not already then table.insert(groups, group_id) end
        end
    end
end

for _, group_id in ipairs(groups) do
    redis.call("DEL", prefix .. ":group:" .. group_id)
end

return 1
"#;

pub struct RedisProvider {
    conn: ConnectionManager,
    inbox_name: String,
    is_fifo: bool,
    max_processing_time: Duration,
    enable_dedup: bool,
    deduplication_interval: Duration,
    enable_dead_letter: bool,
    clock: Arc<dyn Clock>,
}

impl RedisProvider {
    pub fn new(
        conn: ConnectionManager,
        inbox_name: impl Into<String>,
        is_fifo: bool,
        max_processing_time: Duration,
        enable_dedup: bool,
        deduplication_interval: Duration,
        enable_dead_letter: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conn,
            inbox_name: inbox_name.into(),
            is_fifo,
            max_processing_time,
            enable_dedup,
            deduplication_interval,
            enable_dead_letter,
            clock,
        }
    }

    /// Opens a connection manager for `redis_url` and wraps it, mirroring
    /// a leader-election connection setup.
    pub async fn connect(
        redis_url: &str,
        inbox_name: impl Into<String>,
        is_fifo: bool,
        max_processing_time: Duration,
        enable_dedup: bool,
        deduplication_interval: Duration,
        enable_dead_letter: bool,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(
            conn,
            inbox_name,
            is_fifo,
            max_processing_time,
            enable_dedup,
            deduplication_interval,
            enable_dead_letter,
            clock,
        ))
    }

    fn prefix(&self) -> String {
        format!("inbox:{}", self.inbox_name)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix())
    }

    fn captured_key(&self) -> String {
        format!("{}:captured", self.prefix())
    }

    fn msg_key(&self, id: &str) -> String {
        format!("{}:msg:{}", self.prefix(), id)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.prefix())
    }

    fn dlq_msg_key(&self, id: &str) -> String {
        format!("{}:dlqmsg:{}", self.prefix(), id)
    }

    fn group_key(&self, group_id: &str) -> String {
        format!("{}:group:{}", self.prefix(), group_id)
    }

    async fn fetch_message(&self, id: &str) -> Result<Option<InboxMessage>> {
        let mut conn = self.conn.clone();
        let fields: Vec<(String, String)> = conn.hgetall(self.msg_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(message_from_fields(&self.inbox_name, &fields)))
    }
}

fn field(fields: &[(String, String)], key: &str) -> String {
    fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()).unwrap_or_default()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn message_from_fields(inbox_name: &str, fields: &[(String, String)]) -> InboxMessage {
    let received_at_ms: i64 = field(fields, "received_at").parse().unwrap_or(0);
    let captured_at_raw = field(fields, "captured_at");
    let captured_at = non_empty(captured_at_raw).and_then(|v| v.parse::<i64>().ok()).and_then(DateTime::from_timestamp_millis);
    InboxMessage {
        id: field(fields, "id"),
        inbox_name: inbox_name.to_string(),
        message_type: field(fields, "message_type"),
        payload: field(fields, "payload").into_bytes(),
        group_id: non_empty(field(fields, "group_id")),
        collapse_key: non_empty(field(fields, "collapse_key")),
        deduplication_id: non_empty(field(fields, "deduplication_id")),
        attempts_count: field(fields, "attempts_count").parse().unwrap_or(0),
        received_at: DateTime::from_timestamp_millis(received_at_ms).unwrap_or_else(Utc::now),
        captured_at,
        captured_by: non_empty(field(fields, "captured_by")),
    }
}

#[async_trait]
impl StorageProvider for RedisProvider {
    async fn write(&self, message: NewMessage) -> Result<()> {
        self.write_batch(vec![message]).await
    }

    async fn write_batch(&self, messages: Vec<NewMessage>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_utc();
        let mut conn = self.conn.clone();

        let mut script = Script::new(WRITE_BATCH_SCRIPT)
            .key(self.pending_key())
            .arg(self.prefix())
            .arg(if self.enable_dedup { "1" } else { "0" })
            .arg(self.deduplication_interval.as_secs().max(1))
            .arg(messages.len());

        for message in messages {
            let inbox_message = message.into_message(&self.inbox_name, now);
            script = script
                .arg(&inbox_message.id)
                .arg(&inbox_message.message_type)
                .arg(&inbox_message.payload)
                .arg(inbox_message.group_id.unwrap_or_default())
                .arg(inbox_message.collapse_key.unwrap_or_default())
                .arg(inbox_message.deduplication_id.unwrap_or_default())
                .arg(inbox_message.received_at.timestamp_millis());
        }

        let _: i64 = script.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn read_and_capture(&self, worker_id: &str, read_batch_size: u32) -> Result<Vec<InboxMessage>> {
        let now = self.clock.now_utc();
        let now_ms = now.timestamp_millis();
        let cutoff_ms = now_ms - self.max_processing_time.as_millis() as i64;
        let fetch_limit = if self.is_fifo {
            (read_batch_size as isize).saturating_mul(FIFO_CANDIDATE_FACTOR)
        } else {
            read_batch_size as isize
        };
        let mut conn = self.conn.clone();

        let ids: Vec<String> = Script::new(READ_AND_CAPTURE_SCRIPT)
            .key(self.pending_key())
            .key(self.captured_key())
            .arg(self.prefix())
            .arg(now_ms)
            .arg(cutoff_ms)
            .arg(fetch_limit)
            .arg(read_batch_size)
            .arg(worker_id)
            .arg(if self.is_fifo { "1" } else { "0" })
            .arg(self.max_processing_time.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;

        let mut captured = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(message) = self.fetch_message(&id).await? {
                captured.push(message);
            }
        }
        Ok(captured)
    }

    async fn extend_locks(&self, worker_id: &str, message_ids: &[String], new_captured_at: DateTime<Utc>) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut script = Script::new(EXTEND_LOCKS_SCRIPT).key(self.captured_key()).arg(self.prefix()).arg(worker_id).arg(
            new_captured_at.timestamp_millis(),
        );
        script = script.arg(self.max_processing_time.as_millis() as i64);
        for id in message_ids {
            script = script.arg(id);
        }
        let extended: i64 = script.invoke_async(&mut conn).await?;
        Ok(extended as u64)
    }

    async fn apply_results(&self, batch: ApplyResultsBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_utc();
        let mut conn = self.conn.clone();

        let mut script = Script::new(APPLY_RESULTS_SCRIPT)
            .key(self.pending_key())
            .key(self.captured_key())
            .arg(self.prefix())
            .arg(now.timestamp_millis())
            .arg(if self.enable_dead_letter { "1" } else { "0" });

        script = script.arg(batch.to_complete.len());
        for id in &batch.to_complete {
            script = script.arg(id);
        }
        script = script.arg(batch.to_fail.len());
        for id in &batch.to_fail {
            script = script.arg(id);
        }
        script = script.arg(batch.to_release.len());
        for id in &batch.to_release {
            script = script.arg(id);
        }
        script = script.arg(batch.to_dead_letter.len());
        for entry in &batch.to_dead_letter {
            script = script.arg(&entry.id).arg(&entry.reason);
        }

        let _: i64 = script.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn read_dead_letters(&self, max: u32) -> Result<Vec<DeadLetterMessage>> {
        if !self.enable_dead_letter {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(self.dlq_key(), 0, (max as isize).saturating_sub(1).max(0)).await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: Vec<(String, String)> = conn.hgetall(self.dlq_msg_key(&id)).await?;
            if fields.is_empty() {
                continue;
            }
            let received_at_ms: i64 = field(&fields, "received_at").parse().unwrap_or(0);
            let moved_at_ms: i64 = field(&fields, "moved_at").parse().unwrap_or(0);
            records.push(DeadLetterMessage {
                id: field(&fields, "id"),
                inbox_name: self.inbox_name.clone(),
                message_type: field(&fields, "message_type"),
                payload: field(&fields, "payload").into_bytes(),
                group_id: non_empty(field(&fields, "group_id")),
                attempts_count: field(&fields, "attempts_count").parse().unwrap_or(0),
                received_at: DateTime::from_timestamp_millis(received_at_ms).unwrap_or_else(Utc::now),
                failure_reason: field(&fields, "failure_reason"),
                moved_at: DateTime::from_timestamp_millis(moved_at_ms).unwrap_or_else(Utc::now),
            });
        }
        Ok(records)
    }

    async fn cleanup_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrangebyscore(self.dlq_key(), "-inf", cutoff.timestamp_millis()).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        for id in &ids {
            let _: () = conn.del(self.dlq_msg_key(id)).await?;
        }
        let removed: u64 = conn.zrembyscore(self.dlq_key(), "-inf", cutoff.timestamp_millis()).await?;
        Ok(removed)
    }

    /// Dedup keys carry their own `SETEX` TTL; Redis reclaims them
    /// without a sweep. Kept for contract parity with the durable
    /// backends.
    async fn cleanup_dedup_records(&self, _cutoff: DateTime<Utc>, _batch_size: u32) -> Result<u64> {
        Ok(0)
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
impl FifoCapability for RedisProvider {
    async fn release_group_locks(&self, group_ids: &[String]) -> Result<()> {
        if group_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = group_ids.iter().map(|g| self.group_key(g)).collect();
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn release_messages_and_group_locks(&self, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut script = Script::new(RELEASE_MESSAGES_AND_GROUP_LOCKS_SCRIPT)
            .key(self.pending_key())
            .key(self.captured_key())
            .arg(self.prefix());
        for id in message_ids {
            script = script.arg(id);
        }
        let _: i64 = script.invoke_async(&mut conn).await?;
        Ok(())
    }

    /// Group-lock keys carry a `PX` TTL equal to `MaxProcessingTime`
    /// Redis reclaims them without an explicit sweep.
    async fn cleanup_expired_group_locks(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
}

#[async_trait]
impl MaintenanceCapability for RedisProvider {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn health_metrics(&self) -> Result<HealthMetrics> {
        let mut conn = self.conn.clone();
        let pending_count: u64 = conn.zcard(self.pending_key()).await?;
        let captured_count: u64 = conn.zcard(self.captured_key()).await?;
        let dead_letter_count: u64 = if self.enable_dead_letter { conn.zcard(self.dlq_key()).await? } else { 0 };

        let oldest: Vec<(String, f64)> = conn.zrange_withscores(self.pending_key(), 0, 0).await?;
        let oldest_pending_at =
            oldest.first().and_then(|(_, score)| DateTime::from_timestamp_millis(*score as i64));

        Ok(HealthMetrics { pending_count, captured_count, dead_letter_count, oldest_pending_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_from_fields_treats_empty_strings_as_none() {
        let fields = vec![
            ("id".to_string(), "m1".to_string()),
            ("message_type".to_string(), "t".to_string()),
            ("payload".to_string(), String::new()),
            ("group_id".to_string(), String::new()),
            ("collapse_key".to_string(), String::new()),
            ("deduplication_id".to_string(), String::new()),
            ("attempts_count".to_string(), "0".to_string()),
            ("received_at".to_string(), "1700000000000".to_string()),
            ("captured_at".to_string(), String::new()),
            ("captured_by".to_string(), String::new()),
        ];
        let message = message_from_fields("orders", &fields);
        assert_eq!(message.id, "m1");
        assert!(message.group_id.is_none());
        assert!(!message.is_captured());
    }
}
