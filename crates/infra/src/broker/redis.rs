//! Redis-backed broker.
//!
//! Layout per queue `q` (all keys under `prefix`):
//! - `{prefix}:queue:{q}`: list of ready job ids
//! - `{prefix}:queue:{q}:delayed`: zset of job id -> available-at (ms)
//! - `{prefix}:queue:{q}:reserved`: zset of job id -> lease expiry (ms)
//! - `{prefix}:job:{id}`: hash with `envelope` (JSON) and `attempts`
//! - `{prefix}:unique:{key}`: job id holding a unique key
//!
//! Every state change is a Lua script so a lease or release is atomic across
//! concurrent workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::Script;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use super::{Broker, BrokerError, EnqueueOutcome, JobEnvelope, Lease, QueueDepth, ReleaseKind};
use crate::config::QueueTable;
use crate::jobs::JobId;

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "taskpulse";

const ENQUEUE_SCRIPT: &str = r#"
-- KEYS[1] job hash, KEYS[2] ready list, KEYS[3] delayed zset, KEYS[4] unique key ('' when none)
-- ARGV[1] job id, ARGV[2] envelope json, ARGV[3] available-at ms, ARGV[4] now ms
if KEYS[4] ~= '' then
  local holder = redis.call('GET', KEYS[4])
  if holder then
    return {0, holder}
  end
  redis.call('SET', KEYS[4], ARGV[1])
end
redis.call('HSET', KEYS[1], 'envelope', ARGV[2], 'attempts', 0)
if tonumber(ARGV[3]) > tonumber(ARGV[4]) then
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
else
  redis.call('RPUSH', KEYS[2], ARGV[1])
end
return {1, ARGV[1]}
"#;

const LEASE_SCRIPT: &str = r#"
-- KEYS[1] ready list, KEYS[2] delayed zset, KEYS[3] reserved zset
-- ARGV[1] now ms, ARGV[2] lease expiry ms, ARGV[3] job hash key prefix
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('RPUSH', KEYS[1], id)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('LPUSH', KEYS[1], id)
end
while true do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    return nil
  end
  local job = ARGV[3] .. id
  local envelope = redis.call('HGET', job, 'envelope')
  if envelope then
    local attempts = redis.call('HINCRBY', job, 'attempts', 1)
    redis.call('ZADD', KEYS[3], ARGV[2], id)
    return {id, attempts, envelope}
  end
end
"#;

const ACK_SCRIPT: &str = r#"
-- KEYS[1] reserved zset, KEYS[2] job hash, KEYS[3] unique key ('' when none)
-- ARGV[1] job id
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
if KEYS[3] ~= '' and redis.call('GET', KEYS[3]) == ARGV[1] then
  redis.call('DEL', KEYS[3])
end
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
-- KEYS[1] reserved zset, KEYS[2] delayed zset, KEYS[3] ready list, KEYS[4] job hash
-- ARGV[1] job id, ARGV[2] available-at ms, ARGV[3] now ms, ARGV[4] attempts, ARGV[5] envelope json ('' keeps)
if redis.call('EXISTS', KEYS[4]) == 0 then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[4], 'attempts', ARGV[4])
if ARGV[5] ~= '' then
  redis.call('HSET', KEYS[4], 'envelope', ARGV[5])
end
if tonumber(ARGV[2]) > tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
else
  redis.call('RPUSH', KEYS[3], ARGV[1])
end
return 1
"#;

/// Redis broker errors are mapped onto `BrokerError`.
fn map_redis_error(err: redis::RedisError) -> BrokerError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BrokerError::Connection(err.to_string())
    } else {
        BrokerError::Command(err.to_string())
    }
}

fn millis_after(delay: Duration) -> i64 {
    let now = Utc::now().timestamp_millis();
    now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

pub struct RedisBroker {
    conn: MultiplexedConnection,
    queues: Arc<QueueTable>,
    prefix: String,
    enqueue: Script,
    lease: Script,
    ack: Script,
    release: Script,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect to `redis_url`.
    pub async fn connect(redis_url: &str, queues: Arc<QueueTable>) -> Result<Self, BrokerError> {
        Self::connect_with_prefix(redis_url, queues, DEFAULT_KEY_PREFIX).await
    }

    pub async fn connect_with_prefix(
        redis_url: &str,
        queues: Arc<QueueTable>,
        prefix: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Connection(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            conn,
            queues,
            prefix: prefix.into(),
            enqueue: Script::new(ENQUEUE_SCRIPT),
            lease: Script::new(LEASE_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:delayed", self.prefix, queue)
    }

    fn reserved_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:reserved", self.prefix, queue)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}{}", self.job_key_prefix(), id)
    }

    fn unique_key(&self, unique_id: Option<&str>) -> String {
        unique_id
            .map(|key| format!("{}:unique:{}", self.prefix, key))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip(self, envelope), fields(job_id = %envelope.id, queue = %envelope.queue), err)]
    async fn enqueue(&self, envelope: JobEnvelope, delay: Duration) -> Result<EnqueueOutcome, BrokerError> {
        let body = serde_json::to_string(&envelope)?;
        let mut conn = self.conn.clone();
        let (created, holder): (i64, String) = self
            .enqueue
            .key(self.job_key(envelope.id))
            .key(self.ready_key(&envelope.queue))
            .key(self.delayed_key(&envelope.queue))
            .key(self.unique_key(envelope.unique_id.as_deref()))
            .arg(envelope.id.to_string())
            .arg(body)
            .arg(millis_after(delay))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if created == 1 {
            return Ok(EnqueueOutcome::Enqueued(envelope.id));
        }
        let existing = holder
            .parse::<JobId>()
            .map_err(|e| BrokerError::Command(format!("corrupt unique key holder {holder}: {e}")))?;
        debug!(existing = %existing, "duplicate enqueue suppressed");
        Ok(EnqueueOutcome::Duplicate(existing))
    }

    async fn lease(&self, queue: &str) -> Result<Option<Lease>, BrokerError> {
        let retry_after = self.queues.get(queue).retry_after;
        let mut conn = self.conn.clone();
        let leased: Option<(String, u32, String)> = self
            .lease
            .key(self.ready_key(queue))
            .key(self.delayed_key(queue))
            .key(self.reserved_key(queue))
            .arg(Utc::now().timestamp_millis())
            .arg(millis_after(retry_after))
            .arg(self.job_key_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let Some((_, attempt, body)) = leased else {
            return Ok(None);
        };
        let envelope: JobEnvelope = serde_json::from_str(&body)?;
        Ok(Some(Lease {
            envelope,
            attempt,
            leased_at: Utc::now(),
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let envelope = &lease.envelope;
        let mut conn = self.conn.clone();
        let _: i64 = self
            .ack
            .key(self.reserved_key(&envelope.queue))
            .key(self.job_key(envelope.id))
            .key(self.unique_key(envelope.unique_id.as_deref()))
            .arg(envelope.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn release(
        &self,
        lease: &Lease,
        delay: Duration,
        kind: ReleaseKind,
        checkpoint: Option<JsonValue>,
    ) -> Result<(), BrokerError> {
        let envelope = &lease.envelope;
        let attempts = match kind {
            ReleaseKind::Retry => lease.attempt,
            ReleaseKind::Yield => lease.attempt.saturating_sub(1),
        };
        let body = match checkpoint {
            Some(checkpoint) => {
                let mut updated = envelope.clone();
                updated.checkpoint = Some(checkpoint);
                serde_json::to_string(&updated)?
            }
            None => String::new(),
        };

        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(self.reserved_key(&envelope.queue))
            .key(self.delayed_key(&envelope.queue))
            .key(self.ready_key(&envelope.queue))
            .key(self.job_key(envelope.id))
            .arg(envelope.id.to_string())
            .arg(millis_after(delay))
            .arg(Utc::now().timestamp_millis())
            .arg(attempts)
            .arg(body)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if released == 0 {
            tracing::warn!(job_id = %envelope.id, "release of a job the broker no longer holds");
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, BrokerError> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();
        let (ready, due, delayed, reserved): (u64, u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(self.ready_key(queue))
            .cmd("ZCOUNT")
            .arg(self.delayed_key(queue))
            .arg("-inf")
            .arg(now)
            .cmd("ZCOUNT")
            .arg(self.delayed_key(queue))
            .arg(format!("({now}"))
            .arg("+inf")
            .cmd("ZCOUNT")
            .arg(self.reserved_key(queue))
            .arg(format!("({now}"))
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(QueueDepth {
            ready: ready + due,
            delayed,
            reserved,
        })
    }
}
