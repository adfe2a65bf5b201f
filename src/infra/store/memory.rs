//! In-process [`CacheStore`] backend.
//!
//! One mutex guards the whole keyspace, which makes every multi-step operation
//! trivially atomic. Expiry is lazy: a key past its deadline is dropped the
//! next time anything looks at it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::util::lock::{condvar_wait, mutex_lock};

use super::{CacheStore, ConjRegistration, EntryWrite, StoreError, StoreResult, glob_match};

const SOURCE: &str = "infra::store::memory";
const SIGNAL_TOKEN: &[u8] = b"1";

#[derive(Debug, Clone)]
enum Data {
    Str(Bytes),
    Set(HashSet<String>),
    List(VecDeque<Bytes>),
}

#[derive(Debug, Clone)]
struct Slot {
    data: Data,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(data: Data, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self.slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn contains(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn string(&mut self, key: &str) -> StoreResult<Option<Bytes>> {
        match self.live(key).map(|slot| &slot.data) {
            None => Ok(None),
            Some(Data::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_members(&mut self, key: &str) -> StoreResult<Option<&mut HashSet<String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                data: Data::Set(members),
                ..
            }) => Ok(Some(members)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn ensure_kind(&mut self, key: &str, set: bool) -> StoreResult<()> {
        match self.live(key).map(|slot| &slot.data) {
            None | Some(Data::Set(_)) if set => Ok(()),
            None | Some(Data::Str(_)) if !set => Ok(()),
            _ => Err(wrong_type(key)),
        }
    }

    fn sadd(&mut self, key: &str, member: &str) {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(Data::Set(HashSet::new()), None));
        if let Data::Set(members) = &mut slot.data {
            members.insert(member.to_string());
        }
    }

    /// Appends one token to a signal list and resets its lifetime.
    fn push_token(&mut self, key: &str, ttl: Duration) -> StoreResult<()> {
        match self.live(key) {
            Some(Slot {
                data: Data::List(list),
                expires_at,
            }) => {
                list.push_back(Bytes::from_static(SIGNAL_TOKEN));
                *expires_at = Some(Instant::now() + ttl);
            }
            Some(_) => return Err(wrong_type(key)),
            None => {
                let list = VecDeque::from([Bytes::from_static(SIGNAL_TOKEN)]);
                self.slots
                    .insert(key.to_string(), Slot::new(Data::List(list), Some(ttl)));
            }
        }
        Ok(())
    }

    /// Raises the key's lifetime to at least `ttl`; keys without expiry get one.
    fn extend(&mut self, key: &str, ttl: Duration) {
        let now = Instant::now();
        if let Some(slot) = self.live(key) {
            let current = slot.remaining(now).unwrap_or_default();
            if current < ttl {
                slot.expires_at = Some(now + ttl);
            }
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

/// Shared in-memory keyspace with the same semantics the engine expects from Redis.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    signals: Condvar,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a connectivity loss: every call fails with
    /// [`StoreError::Unavailable`] until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "len");
        let now = Instant::now();
        keyspace.slots.retain(|_, slot| !slot.is_expired(now));
        keyspace.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn with<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Keyspace) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check()?;
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, op);
        f(&mut keyspace)
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.with("get", |ks| ks.string(key))
    }

    fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<Bytes>>> {
        self.with("mget", |ks| {
            Ok(keys
                .iter()
                .map(|key| ks.string(key).unwrap_or(None))
                .collect())
        })
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.with("set", |ks| {
            ks.slots.insert(
                key.to_string(),
                Slot::new(Data::Str(Bytes::copy_from_slice(value)), ttl),
            );
            Ok(())
        })
    }

    fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        self.with("set_nx", |ks| {
            if ks.contains(key) {
                return Ok(false);
            }
            ks.slots.insert(
                key.to_string(),
                Slot::new(Data::Str(Bytes::copy_from_slice(value)), Some(ttl)),
            );
            Ok(true)
        })
    }

    fn del(&self, keys: &[String]) -> StoreResult<usize> {
        self.with("del", |ks| {
            Ok(keys
                .iter()
                .filter(|key| ks.contains(key) && ks.slots.remove(key.as_str()).is_some())
                .count())
        })
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.with("exists", |ks| Ok(ks.contains(key)))
    }

    fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.with("expire", |ks| match ks.live(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.with("ttl", |ks| {
            let now = Instant::now();
            Ok(ks.live(key).and_then(|slot| slot.remaining(now)))
        })
    }

    fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.with("smembers", |ks| {
            Ok(ks
                .set_members(key)?
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn scard(&self, key: &str) -> StoreResult<usize> {
        self.with("scard", |ks| {
            Ok(ks.set_members(key)?.map_or(0, |members| members.len()))
        })
    }

    fn srem(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        self.with("srem", |ks| {
            let Some(set) = ks.set_members(key)? else {
                return Ok(0);
            };
            let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
            if set.is_empty() {
                ks.slots.remove(key);
            }
            Ok(removed)
        })
    }

    fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.with("scan_match", |ks| {
            let now = Instant::now();
            let mut keys: Vec<String> = ks
                .slots
                .iter()
                .filter(|(key, slot)| !slot.is_expired(now) && glob_match(pattern, key))
                .map(|(key, _)| key.clone())
                .collect();
            keys.sort_unstable();
            Ok(keys)
        })
    }

    fn push_signal(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.with("push_signal", |ks| ks.push_token(key, ttl))?;
        self.signals.notify_all();
        Ok(())
    }

    fn release_lock(
        &self,
        key: &str,
        marker: &[u8],
        signal_key: &str,
        signal_ttl: Duration,
    ) -> StoreResult<bool> {
        let released = self.with("release_lock", |ks| {
            let held = ks.string(key)?.is_some_and(|value| value.as_ref() == marker);
            ks.push_token(signal_key, signal_ttl)?;
            if held {
                ks.slots.remove(key);
            }
            Ok(held)
        })?;
        self.signals.notify_all();
        Ok(released)
    }

    fn wait_signal(&self, key: &str, timeout: Duration) -> StoreResult<bool> {
        self.check()?;
        let deadline = Instant::now() + timeout;
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "wait_signal");
        loop {
            if let Some(slot) = keyspace.live(key) {
                let Data::List(list) = &mut slot.data else {
                    return Err(wrong_type(key));
                };
                if list.pop_front().is_some() {
                    if list.is_empty() {
                        keyspace.slots.remove(key);
                    }
                    return Ok(true);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            keyspace = condvar_wait(&self.signals, keyspace, deadline - now, SOURCE, "wait_signal");
        }
    }

    fn cache_entry(&self, write: &EntryWrite<'_>) -> StoreResult<bool> {
        self.with("cache_entry", |ks| {
            if let Some(precall_key) = write.precall_key {
                if !ks.contains(precall_key) {
                    return Ok(false);
                }
            }

            // Validate before mutating so a type error leaves nothing half-written.
            for reg in write.registrations {
                ks.ensure_kind(&reg.scheme_key, true)?;
                ks.ensure_kind(&reg.conj_key, true)?;
            }

            for reg in write.registrations {
                ks.sadd(&reg.scheme_key, &reg.scheme);
                ks.sadd(&reg.conj_key, write.key);
                if let Some(conj_ttl) = write.conj_ttl {
                    ks.extend(&reg.conj_key, conj_ttl);
                }
            }

            ks.slots.insert(
                write.key.to_string(),
                Slot::new(Data::Str(Bytes::copy_from_slice(write.value)), Some(write.ttl)),
            );
            Ok(true)
        })
    }

    fn delete_conjunctions(&self, conj_keys: &[String]) -> StoreResult<usize> {
        self.with("delete_conjunctions", |ks| {
            let mut members = HashSet::new();
            for conj_key in conj_keys {
                if let Some(set) = ks.set_members(conj_key)? {
                    members.extend(set.iter().cloned());
                }
            }

            let deleted = members
                .iter()
                .filter(|key| ks.contains(key) && ks.slots.remove(key.as_str()).is_some())
                .count();
            for conj_key in conj_keys {
                ks.slots.remove(conj_key);
            }
            Ok(deleted)
        })
    }

    fn ensure_stamps(
        &self,
        registrations: &[ConjRegistration],
        fresh_stamp: &str,
        conj_ttl: Option<Duration>,
    ) -> StoreResult<Vec<String>> {
        self.with("ensure_stamps", |ks| {
            for reg in registrations {
                ks.ensure_kind(&reg.scheme_key, true)?;
                ks.ensure_kind(&reg.conj_key, false)?;
            }

            let mut stamps = Vec::with_capacity(registrations.len());
            for reg in registrations {
                ks.sadd(&reg.scheme_key, &reg.scheme);
                let stamp = match ks.string(&reg.conj_key)? {
                    Some(existing) => existing,
                    None => {
                        let stamp = Bytes::copy_from_slice(fresh_stamp.as_bytes());
                        ks.slots
                            .insert(reg.conj_key.clone(), Slot::new(Data::Str(stamp.clone()), None));
                        stamp
                    }
                };
                if let Some(conj_ttl) = conj_ttl {
                    ks.extend(&reg.conj_key, conj_ttl);
                }
                stamps.push(String::from_utf8_lossy(&stamp).into_owned());
            }
            Ok(stamps)
        })
    }

    fn flush(&self) -> StoreResult<()> {
        self.with("flush", |ks| {
            ks.slots.clear();
            Ok(())
        })
    }
}
