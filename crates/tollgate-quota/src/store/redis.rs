//! Redis counter store.
//!
//! All three operations run as server-side Lua scripts, so the whole
//! check-and-mutate sequence for a key executes as one indivisible unit —
//! Redis serialises script execution, which is what makes cluster-wide
//! admission decisions linearisable per key.
//!
//! Key scheme:
//! - `rl:{key}:{dim}:{bucket}` — counter segments, TTL 2·W
//! - `rl:res:{uuid}` — reservation hash `{key, bucket, in, out, created}`,
//!   TTL 2·T_sweep (the sweep is expected to act well before expiry)
//! - `rl:res:idx` — ZSET of open reservation ids scored by t₀, scanned by
//!   the sweep

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tollgate_common::{ApiKey, KeyLimits, UnixMillis};
use tracing::{debug, warn};

use super::{
    AdmitVerdict, CommitOutcome, CounterStore, ReleaseOutcome, StoreAdmit, StoreError,
};
use crate::reservation::ReservationId;
use crate::window::{Dimension, WindowSpec};

const RESERVATION_INDEX_KEY: &str = "rl:res:idx";

/// Retry schedule for reconciliation writes. Admission is never retried here;
/// its failure handling is the engine's fail-open/fail-closed policy.
const RECONCILE_ATTEMPTS: u32 = 3;
const RECONCILE_BACKOFF_MS: u64 = 50;

/// Atomic admission: sum each dimension over the window, reject on the
/// violating dimension with the longest recovery, otherwise add and persist
/// the reservation.
///
/// ARGV: api_key, now_ms, segment_ms, n_segments, limit_in, limit_out,
/// limit_req, add_in, add_out, seg_ttl_ms, res_id, res_ttl_ms, window_ms
/// Reply: {admitted, used_in, used_out, used_req, binding, retry_ms}
const ADMIT_SCRIPT: &str = r#"
local key = ARGV[1]
local now = tonumber(ARGV[2])
local seg_ms = tonumber(ARGV[3])
local n = tonumber(ARGV[4])
local limits = { tonumber(ARGV[5]), tonumber(ARGV[6]), tonumber(ARGV[7]) }
local adds = { tonumber(ARGV[8]), tonumber(ARGV[9]), 1 }
local seg_ttl = tonumber(ARGV[10])
local res_id = ARGV[11]
local res_ttl = tonumber(ARGV[12])
local window_ms = tonumber(ARGV[13])

local dims = { 'in', 'out', 'req' }
local b = math.floor(now / seg_ms)
local used = { 0, 0, 0 }

for d = 1, 3 do
  local sum = 0
  for i = 0, n - 1 do
    local v = redis.call('GET', 'rl:' .. key .. ':' .. dims[d] .. ':' .. (b - i))
    if v then sum = sum + tonumber(v) end
  end
  used[d] = sum
end

local binding = 0
local retry = -1
for d = 1, 3 do
  if used[d] + adds[d] > limits[d] then
    local r = window_ms
    for i = n - 1, 0, -1 do
      local bucket = b - i
      if redis.call('EXISTS', 'rl:' .. key .. ':' .. dims[d] .. ':' .. bucket) == 1 then
        r = (bucket + n) * seg_ms - now
        break
      end
    end
    if r > retry then
      retry = r
      binding = d
    end
  end
end
if binding > 0 then
  return { 0, used[1], used[2], used[3], binding, retry }
end

for d = 1, 3 do
  if adds[d] > 0 then
    local k = 'rl:' .. key .. ':' .. dims[d] .. ':' .. b
    redis.call('INCRBY', k, adds[d])
    redis.call('PEXPIRE', k, seg_ttl)
  end
end

local rk = 'rl:res:' .. res_id
redis.call('HSET', rk, 'key', key, 'bucket', b, 'in', adds[1], 'out', adds[2], 'created', now)
redis.call('PEXPIRE', rk, res_ttl)
redis.call('ZADD', 'rl:res:idx', now, res_id)
return { 1, used[1], used[2], used[3], 0, 0 }
"#;

/// Shared tail of the commit/release scripts: apply one signed delta to the
/// bucket of origin, falling back to the oldest live bucket when b₀ expired,
/// flooring the segment at zero.
const APPLY_DELTA_FN: &str = r#"
local fallback = 0
local function apply(key, dim, b0, delta, b, n, seg_ms, seg_ttl)
  if delta == 0 then return end
  local target = b0
  if redis.call('EXISTS', 'rl:' .. key .. ':' .. dim .. ':' .. target) == 0 then
    target = nil
    for i = n - 1, 0, -1 do
      local bucket = b - i
      if redis.call('EXISTS', 'rl:' .. key .. ':' .. dim .. ':' .. bucket) == 1 then
        target = bucket
        break
      end
    end
    if target == nil then
      if delta > 0 then
        target = b
      else
        return
      end
    end
    fallback = 1
  end
  local k = 'rl:' .. key .. ':' .. dim .. ':' .. target
  local v = redis.call('INCRBY', k, delta)
  if v < 0 then redis.call('SET', k, 0) end
  redis.call('PEXPIRE', k, seg_ttl)
end
"#;

/// Atomic commit: replace the reservation's provisional token additions with
/// actual usage. Missing or already-settled reservations are a no-op.
///
/// ARGV: res_id, in_actual, out_actual, now_ms, segment_ms, n_segments,
/// seg_ttl_ms
/// Reply: {applied, fallback}
const COMMIT_SCRIPT_TAIL: &str = r#"
local res_id = ARGV[1]
local rk = 'rl:res:' .. res_id
local res = redis.call('HMGET', rk, 'key', 'bucket', 'in', 'out')
if not res[1] then
  redis.call('ZREM', 'rl:res:idx', res_id)
  return { 0, 0 }
end

local now = tonumber(ARGV[4])
local seg_ms = tonumber(ARGV[5])
local n = tonumber(ARGV[6])
local seg_ttl = tonumber(ARGV[7])
local b = math.floor(now / seg_ms)
local key = res[1]
local b0 = tonumber(res[2])

apply(key, 'in', b0, tonumber(ARGV[2]) - tonumber(res[3]), b, n, seg_ms, seg_ttl)
apply(key, 'out', b0, tonumber(ARGV[3]) - tonumber(res[4]), b, n, seg_ms, seg_ttl)

redis.call('DEL', rk)
redis.call('ZREM', 'rl:res:idx', res_id)
return { 1, fallback }
"#;

/// Atomic release: return the full provisional triple. Idempotent.
///
/// ARGV: res_id, now_ms, segment_ms, n_segments, seg_ttl_ms
/// Reply: {applied, fallback}
const RELEASE_SCRIPT_TAIL: &str = r#"
local res_id = ARGV[1]
local rk = 'rl:res:' .. res_id
local res = redis.call('HMGET', rk, 'key', 'bucket', 'in', 'out')
if not res[1] then
  redis.call('ZREM', 'rl:res:idx', res_id)
  return { 0, 0 }
end

local now = tonumber(ARGV[2])
local seg_ms = tonumber(ARGV[3])
local n = tonumber(ARGV[4])
local seg_ttl = tonumber(ARGV[5])
local b = math.floor(now / seg_ms)
local key = res[1]
local b0 = tonumber(res[2])

apply(key, 'in', b0, -tonumber(res[3]), b, n, seg_ms, seg_ttl)
apply(key, 'out', b0, -tonumber(res[4]), b, n, seg_ms, seg_ttl)
apply(key, 'req', b0, -1, b, n, seg_ms, seg_ttl)

redis.call('DEL', rk)
redis.call('ZREM', 'rl:res:idx', res_id)
return { 1, fallback }
"#;

/// Redis implementation of [`CounterStore`].
pub struct RedisCounterStore {
    conn: ConnectionManager,
    window: WindowSpec,
    reservation_ttl_ms: u64,
    op_timeout: Duration,
    admit_script: Script,
    commit_script: Script,
    release_script: Script,
}

impl RedisCounterStore {
    /// Connect to Redis and prepare the scripts.
    pub async fn connect(
        url: &str,
        window: WindowSpec,
        sweep_secs: u64,
        op_timeout_ms: u64,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(
            conn,
            window,
            sweep_secs,
            op_timeout_ms,
        ))
    }

    /// Build a store over an existing connection manager.
    pub fn with_connection(
        conn: ConnectionManager,
        window: WindowSpec,
        sweep_secs: u64,
        op_timeout_ms: u64,
    ) -> Self {
        Self {
            conn,
            window,
            reservation_ttl_ms: 2 * sweep_secs * 1_000,
            op_timeout: Duration::from_millis(op_timeout_ms),
            admit_script: Script::new(ADMIT_SCRIPT),
            commit_script: Script::new(&format!("{APPLY_DELTA_FN}\n{COMMIT_SCRIPT_TAIL}")),
            release_script: Script::new(&format!("{APPLY_DELTA_FN}\n{RELEASE_SCRIPT_TAIL}")),
        }
    }

    /// Bound a store round-trip by the configured operation timeout.
    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::Connection),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    /// Run a reconciliation script with bounded retries; transient store
    /// failures here must not turn into leaked reservations (the sweep is the
    /// last resort, not the first).
    async fn reconcile_with_retries(
        &self,
        script: &Script,
        args: &[String],
        op: &'static str,
    ) -> Result<Vec<i64>, StoreError> {
        let mut backoff = RECONCILE_BACKOFF_MS;
        let mut last_err = StoreError::Timeout;
        for attempt in 1..=RECONCILE_ATTEMPTS {
            let mut conn = self.conn.clone();
            let mut invocation = script.prepare_invoke();
            for arg in args {
                invocation.arg(arg);
            }
            match self.bounded(invocation.invoke_async(&mut conn)).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    warn!(op, attempt, error = %err, "store reconciliation attempt failed");
                    last_err = err;
                }
            }
            if attempt < RECONCILE_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff *= 2;
            }
        }
        metrics::counter!("tollgate_store_retries_exhausted_total").increment(1);
        Err(last_err)
    }

    fn parse_settle_reply(reply: Vec<i64>, op: &'static str) -> Result<(bool, bool), StoreError> {
        match reply.as_slice() {
            [applied, fallback] => Ok((*applied == 1, *fallback == 1)),
            other => Err(StoreError::Malformed(format!(
                "{op} reply of length {}",
                other.len()
            ))),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn admit(
        &self,
        key: &ApiKey,
        limits: &KeyLimits,
        in_est: u64,
        out_reserve: u64,
        now: UnixMillis,
    ) -> Result<StoreAdmit, StoreError> {
        let reservation = ReservationId::new();
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .bounded(
                self.admit_script
                    .prepare_invoke()
                    .arg(key.as_str())
                    .arg(now)
                    .arg(self.window.segment_ms)
                    .arg(self.window.segments)
                    .arg(limits.input_tpm)
                    .arg(limits.output_tpm)
                    .arg(limits.rpm)
                    .arg(in_est)
                    .arg(out_reserve)
                    .arg(self.window.segment_ttl_ms())
                    .arg(reservation.to_string())
                    .arg(self.reservation_ttl_ms)
                    .arg(self.window.window_ms())
                    .invoke_async(&mut conn),
            )
            .await?;

        let [admitted, used_in, used_out, used_req, binding, retry_ms] = reply.as_slice() else {
            return Err(StoreError::Malformed(format!(
                "admit reply of length {}",
                reply.len()
            )));
        };
        let used = [
            (*used_in).max(0) as u64,
            (*used_out).max(0) as u64,
            (*used_req).max(0) as u64,
        ];

        let verdict = if *admitted == 1 {
            debug!(key = %key, reservation = %reservation, "admitted");
            AdmitVerdict::Admitted { reservation }
        } else {
            let binding = Dimension::from_index((*binding as usize).wrapping_sub(1))
                .ok_or_else(|| StoreError::Malformed(format!("binding dimension {binding}")))?;
            AdmitVerdict::Rejected {
                binding,
                retry_after_secs: self.window.clamp_retry_secs((*retry_ms).max(0) as u64),
            }
        };

        Ok(StoreAdmit { verdict, used })
    }

    async fn commit(
        &self,
        id: &ReservationId,
        in_actual: u64,
        out_actual: u64,
        now: UnixMillis,
    ) -> Result<CommitOutcome, StoreError> {
        let args = [
            id.to_string(),
            in_actual.to_string(),
            out_actual.to_string(),
            now.to_string(),
            self.window.segment_ms.to_string(),
            self.window.segments.to_string(),
            self.window.segment_ttl_ms().to_string(),
        ];
        let reply = self
            .reconcile_with_retries(&self.commit_script, &args, "commit")
            .await?;
        let (applied, fallback) = Self::parse_settle_reply(reply, "commit")?;
        Ok(CommitOutcome { applied, fallback })
    }

    async fn release(
        &self,
        id: &ReservationId,
        now: UnixMillis,
    ) -> Result<ReleaseOutcome, StoreError> {
        let args = [
            id.to_string(),
            now.to_string(),
            self.window.segment_ms.to_string(),
            self.window.segments.to_string(),
            self.window.segment_ttl_ms().to_string(),
        ];
        let reply = self
            .reconcile_with_retries(&self.release_script, &args, "release")
            .await?;
        let (applied, _) = Self::parse_settle_reply(reply, "release")?;
        Ok(ReleaseOutcome { applied })
    }

    async fn open_reservations_older_than(
        &self,
        cutoff: UnixMillis,
        limit: usize,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = self
            .bounded(conn.zrangebyscore_limit(
                RESERVATION_INDEX_KEY,
                0,
                cutoff as isize,
                0,
                limit as isize,
            ))
            .await?;

        Ok(members
            .iter()
            .filter_map(|m| m.parse::<ReservationId>().ok())
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}
