//! Redis-backed [`CacheStore`].
//!
//! The atomic operations run as Lua scripts. Every script type-checks all
//! keys it touches before writing anything, so a `WRONGTYPE` reply means the
//! keyspace was left untouched.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use redis::{Client, Connection, RedisError, Script};

use crate::util::lock::mutex_lock;

use super::{CacheStore, ConjRegistration, EntryWrite, StoreError, StoreResult};

const SOURCE: &str = "infra::store::redis_backend";
const SCAN_COUNT: usize = 500;

static CACHE_ENTRY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local key = KEYS[1]
local precall = KEYS[2]
if precall ~= '' and redis.call('exists', precall) == 0 then
  return 0
end
local n = (#KEYS - 2) / 2
for i = 1, n do
  for _, k in ipairs({KEYS[1 + 2 * i], KEYS[2 + 2 * i]}) do
    local kind = redis.call('type', k).ok
    if kind ~= 'none' and kind ~= 'set' then
      return redis.error_reply('WRONGTYPE ' .. k)
    end
  end
end
local conj_ttl = tonumber(ARGV[3])
for i = 1, n do
  local scheme_key = KEYS[1 + 2 * i]
  local conj_key = KEYS[2 + 2 * i]
  redis.call('sadd', scheme_key, ARGV[3 + i])
  redis.call('sadd', conj_key, key)
  if conj_ttl > 0 and redis.call('pttl', conj_key) < conj_ttl then
    redis.call('pexpire', conj_key, conj_ttl)
  end
end
redis.call('set', key, ARGV[1], 'PX', ARGV[2])
return 1
"#,
    )
});

static DELETE_CONJUNCTIONS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
for _, k in ipairs(KEYS) do
  local kind = redis.call('type', k).ok
  if kind ~= 'none' and kind ~= 'set' then
    return redis.error_reply('WRONGTYPE ' .. k)
  end
end
local seen = {}
local deleted = 0
for _, k in ipairs(KEYS) do
  for _, member in ipairs(redis.call('smembers', k)) do
    if not seen[member] then
      seen[member] = true
      deleted = deleted + redis.call('del', member)
    end
  end
  redis.call('del', k)
end
return deleted
"#,
    )
});

static ENSURE_STAMPS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local n = #KEYS / 2
for i = 1, n do
  local scheme_kind = redis.call('type', KEYS[2 * i - 1]).ok
  if scheme_kind ~= 'none' and scheme_kind ~= 'set' then
    return redis.error_reply('WRONGTYPE ' .. KEYS[2 * i - 1])
  end
  local stamp_kind = redis.call('type', KEYS[2 * i]).ok
  if stamp_kind ~= 'none' and stamp_kind ~= 'string' then
    return redis.error_reply('WRONGTYPE ' .. KEYS[2 * i])
  end
end
local conj_ttl = tonumber(ARGV[2])
local stamps = {}
for i = 1, n do
  local conj_key = KEYS[2 * i]
  redis.call('sadd', KEYS[2 * i - 1], ARGV[2 + i])
  local stamp = redis.call('get', conj_key)
  if not stamp then
    stamp = ARGV[1]
    redis.call('set', conj_key, stamp)
  end
  if conj_ttl > 0 and redis.call('pttl', conj_key) < conj_ttl then
    redis.call('pexpire', conj_key, conj_ttl)
  end
  stamps[i] = stamp
end
return stamps
"#,
    )
});

static RELEASE_LOCK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local key_kind = redis.call('type', KEYS[1]).ok
if key_kind ~= 'none' and key_kind ~= 'string' then
  return redis.error_reply('WRONGTYPE ' .. KEYS[1])
end
local signal_kind = redis.call('type', KEYS[2]).ok
if signal_kind ~= 'none' and signal_kind ~= 'list' then
  return redis.error_reply('WRONGTYPE ' .. KEYS[2])
end
local held = 0
if redis.call('get', KEYS[1]) == ARGV[1] then
  redis.call('del', KEYS[1])
  held = 1
end
redis.call('rpush', KEYS[2], 1)
redis.call('pexpire', KEYS[2], ARGV[2])
return held
"#,
    )
});

/// Store backed by a single Redis database.
///
/// Commands share one connection behind a mutex; blocking waits on signal
/// lists open a dedicated connection so they never hold that mutex.
pub struct RedisStore {
    client: Client,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    pub fn open(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(map_err)?;
        let conn = client.get_connection().map_err(map_err)?;
        Ok(Self {
            client,
            conn: Mutex::new(conn),
        })
    }

    fn query<T: redis::FromRedisValue>(
        &self,
        op: &'static str,
        cmd: &redis::Cmd,
    ) -> StoreResult<T> {
        let mut conn = mutex_lock(&self.conn, SOURCE, op);
        cmd.query(&mut *conn).map_err(map_err)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn map_err(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        StoreError::Unavailable(err.to_string())
    } else if err.code() == Some("WRONGTYPE") {
        StoreError::WrongType {
            key: err.detail().unwrap_or_default().to_string(),
        }
    } else {
        StoreError::Protocol(err.to_string())
    }
}

impl CacheStore for RedisStore {
    fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let value: Option<Vec<u8>> = self.query("get", redis::cmd("GET").arg(key))?;
        Ok(value.map(Bytes::from))
    }

    fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values: Vec<Option<Vec<u8>>> = self.query("mget", &cmd)?;
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        self.query("set", &cmd)
    }

    fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let reply: Option<String> = self.query(
            "set_nx",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis(ttl)),
        )?;
        Ok(reply.is_some())
    }

    fn del(&self, keys: &[String]) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        self.query("del", &cmd)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.query("exists", redis::cmd("EXISTS").arg(key))
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.query("expire", redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))
    }

    fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let pttl: i64 = self.query("ttl", redis::cmd("PTTL").arg(key))?;
        Ok(u64::try_from(pttl).ok().map(Duration::from_millis))
    }

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.query("smembers", redis::cmd("SMEMBERS").arg(key))
    }

    fn scard(&self, key: &str) -> StoreResult<usize> {
        self.query("scard", redis::cmd("SCARD").arg(key))
    }

    fn srem(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key);
        for member in members {
            cmd.arg(member);
        }
        self.query("srem", &cmd)
    }

    fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self.query(
                "scan_match",
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT),
            )?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    fn push_signal(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = mutex_lock(&self.conn, SOURCE, "push_signal");
        redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(1)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .ignore()
            .query::<()>(&mut *conn)
            .map_err(map_err)
    }

    fn release_lock(
        &self,
        key: &str,
        marker: &[u8],
        signal_key: &str,
        signal_ttl: Duration,
    ) -> StoreResult<bool> {
        let mut invocation = RELEASE_LOCK.prepare_invoke();
        invocation
            .key(key)
            .key(signal_key)
            .arg(marker)
            .arg(millis(signal_ttl));
        let mut conn = mutex_lock(&self.conn, SOURCE, "release_lock");
        let released: i64 = invocation.invoke(&mut *conn).map_err(map_err)?;
        Ok(released == 1)
    }

    fn wait_signal(&self, key: &str, timeout: Duration) -> StoreResult<bool> {
        let mut conn = self.client.get_connection().map_err(map_err)?;
        let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout.as_secs_f64().max(0.001))
            .query(&mut conn)
            .map_err(map_err)?;
        Ok(popped.is_some())
    }

    fn cache_entry(&self, write: &EntryWrite<'_>) -> StoreResult<bool> {
        let mut invocation = CACHE_ENTRY.prepare_invoke();
        invocation.key(write.key).key(write.precall_key.unwrap_or(""));
        for reg in write.registrations {
            invocation.key(&reg.scheme_key).key(&reg.conj_key);
        }
        invocation
            .arg(write.value)
            .arg(millis(write.ttl))
            .arg(write.conj_ttl.map_or(0, millis));
        for reg in write.registrations {
            invocation.arg(&reg.scheme);
        }

        let mut conn = mutex_lock(&self.conn, SOURCE, "cache_entry");
        let stored: i64 = invocation.invoke(&mut *conn).map_err(map_err)?;
        Ok(stored == 1)
    }

    fn delete_conjunctions(&self, conj_keys: &[String]) -> StoreResult<usize> {
        if conj_keys.is_empty() {
            return Ok(0);
        }
        let mut invocation = DELETE_CONJUNCTIONS.prepare_invoke();
        for key in conj_keys {
            invocation.key(key);
        }
        let mut conn = mutex_lock(&self.conn, SOURCE, "delete_conjunctions");
        invocation.invoke(&mut *conn).map_err(map_err)
    }

    fn ensure_stamps(
        &self,
        registrations: &[ConjRegistration],
        fresh_stamp: &str,
        conj_ttl: Option<Duration>,
    ) -> StoreResult<Vec<String>> {
        if registrations.is_empty() {
            return Ok(Vec::new());
        }
        let mut invocation = ENSURE_STAMPS.prepare_invoke();
        for reg in registrations {
            invocation.key(&reg.scheme_key).key(&reg.conj_key);
        }
        invocation.arg(fresh_stamp).arg(conj_ttl.map_or(0, millis));
        for reg in registrations {
            invocation.arg(&reg.scheme);
        }
        let mut conn = mutex_lock(&self.conn, SOURCE, "ensure_stamps");
        invocation.invoke(&mut *conn).map_err(map_err)
    }

    fn flush(&self) -> StoreResult<()> {
        self.query("flush", &redis::cmd("FLUSHDB"))
    }
}
