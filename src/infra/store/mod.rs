//! Backing key-value store abstraction.
//!
//! The engine is a safety protocol layered over a shared store. [`CacheStore`]
//! names the primitives it needs; the multi-step operations (`cache_entry`,
//! `delete_conjunctions`, `ensure_stamps`, `release_lock`) must each execute
//! atomically in the backend.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_backend::RedisStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("key `{key}` holds the wrong kind of value")]
    WrongType { key: String },
    #[error("store protocol error: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Registration of one cache entry under one conjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConjRegistration {
    /// `{prefix}conj:{table}:{canonical}`.
    pub conj_key: String,
    /// `{prefix}schemes:{table}`.
    pub scheme_key: String,
    /// Field shape added to `scheme_key`.
    pub scheme: String,
}

/// Arguments of the atomic entry write.
#[derive(Debug, Clone)]
pub struct EntryWrite<'a> {
    pub key: &'a str,
    pub value: &'a [u8],
    pub ttl: Duration,
    pub registrations: &'a [ConjRegistration],
    /// Write only if this key still exists.
    pub precall_key: Option<&'a str>,
    /// Minimum lifetime of every conjunction set; `None` leaves them persistent.
    pub conj_ttl: Option<Duration>,
}

/// Primitives the cache engine needs from its store.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<Bytes>>>;

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// `SET key value NX PX ttl`; true when the key was set.
    fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Returns how many of `keys` existed.
    fn del(&self, keys: &[String]) -> StoreResult<usize>;

    fn exists(&self, key: &str) -> StoreResult<bool>;

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining lifetime; `None` for missing keys and keys without expiry.
    fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    fn scard(&self, key: &str) -> StoreResult<usize>;

    fn srem(&self, key: &str, members: &[String]) -> StoreResult<usize>;

    /// Every key matching a glob pattern (`*`, `?`), iterated with a cursor.
    fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Pushes one token onto a signal list and gives the list a short expiry.
    fn push_signal(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically: delete `key` if it still holds `marker`, then push one token
    /// onto `signal_key`. Returns whether the marker was deleted.
    fn release_lock(
        &self,
        key: &str,
        marker: &[u8],
        signal_key: &str,
        signal_ttl: Duration,
    ) -> StoreResult<bool>;

    /// Blocks until a token can be popped from the signal list or `timeout` passes.
    fn wait_signal(&self, key: &str, timeout: Duration) -> StoreResult<bool>;

    /// Atomically: check the precall key, register the entry under every
    /// conjunction and scheme, extend conjunction lifetimes, store the value.
    /// Returns false (and changes nothing) when the precall key is gone.
    fn cache_entry(&self, write: &EntryWrite<'_>) -> StoreResult<bool>;

    /// Atomically: union the members of `conj_keys`, delete those entries and
    /// the conjunction sets. Returns how many entries were deleted.
    fn delete_conjunctions(&self, conj_keys: &[String]) -> StoreResult<usize>;

    /// Atomically: register schemes, set `fresh_stamp` on every conjunction key
    /// that has no stamp, extend lifetimes, and return the current stamps.
    fn ensure_stamps(
        &self,
        registrations: &[ConjRegistration],
        fresh_stamp: &str,
        conj_ttl: Option<Duration>,
    ) -> StoreResult<Vec<String>>;

    /// Drops the whole namespace.
    fn flush(&self) -> StoreResult<()>;
}

/// Glob matching with `*` and `?`, as used by `SCAN MATCH`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::glob_match;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("conj:post:*", "conj:post:id=1"));
        assert!(glob_match("conj:post:*", "conj:post:"));
        assert!(!glob_match("conj:post:*", "conj:poster:id=1"));
        assert!(glob_match("{p}:conj:*", "{p}:conj:t:a=1"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*", ""));
        assert!(glob_match("*x*y", "axxby"));
    }
}
