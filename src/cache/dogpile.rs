//! Dogpile prevention.
//!
//! The first reader to miss claims the key with a lock marker unique to it and
//! computes; everybody else blocks on the key's signal list until the holder
//! releases, then re-reads. A waiter that wakes to a value pushes the token
//! back so the next waiter wakes too; one that wakes to a still-locked key
//! goes back to waiting without relaying. The marker expires after the lock
//! timeout, so a crashed holder delays waiters by at most that long.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CacheResult;
use crate::infra::store::CacheStore;
use crate::query::Dnf;

use super::config::CacheConfig;
use super::coordinator::{Coordinator, LOCK_MARKER};

const SIGNAL_TTL: Duration = Duration::from_secs(1);

/// Marker a holder stored under the key it locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(Bytes);

impl LockToken {
    fn generate() -> Self {
        let mut marker = LOCK_MARKER.to_vec();
        marker.extend_from_slice(Uuid::new_v4().simple().to_string().as_bytes());
        Self(Bytes::from(marker))
    }

    pub fn marker(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// A computed value was already present.
    Hit(Bytes),
    /// The caller now holds the lock and must compute, write and release.
    Acquired(LockToken),
}

pub struct Dogpile {
    store: Arc<dyn CacheStore>,
    coordinator: Arc<Coordinator>,
    config: Arc<CacheConfig>,
}

pub fn signal_key(key: &str) -> String {
    format!("{key}:signal")
}

impl Dogpile {
    pub fn new(
        store: Arc<dyn CacheStore>,
        coordinator: Arc<Coordinator>,
        config: Arc<CacheConfig>,
    ) -> Self {
        Self {
            store,
            coordinator,
            config,
        }
    }

    pub fn read(&self, prefix: &str, key: &str, dnf: &Dnf) -> CacheResult<Option<Bytes>> {
        self.coordinator.read(prefix, key, dnf)
    }

    /// Returns the cached value, or the lock when nobody else computes it.
    ///
    /// When the store is unavailable and the degrade policy applies this
    /// reports [`LockOutcome::Acquired`] so the caller computes unlocked.
    pub fn read_or_lock(
        &self,
        prefix: &str,
        key: &str,
        dnf: &Dnf,
        timeout: Duration,
    ) -> CacheResult<LockOutcome> {
        let signal = signal_key(key);
        let mut woken = false;
        loop {
            if let Some(value) = self.read(prefix, key, dnf)? {
                if woken {
                    // Relay so the next waiter wakes as well.
                    self.config.degrade(
                        "push_signal",
                        self.store.push_signal(&signal, SIGNAL_TTL),
                        || (),
                    )?;
                }
                return Ok(LockOutcome::Hit(value));
            }

            let token = LockToken::generate();
            let claimed = self.config.degrade(
                "set_nx",
                self.store.set_nx(key, token.marker(), timeout),
                || true,
            )?;
            if claimed {
                self.config.degrade(
                    "del",
                    self.store.del(std::slice::from_ref(&signal)),
                    || 0,
                )?;
                debug!(key, "Dogpile lock acquired");
                return Ok(LockOutcome::Acquired(token));
            }

            counter!("granule_cache_lock_wait_total").increment(1);
            debug!(key, timeout_ms = timeout.as_millis() as u64, "Waiting for dogpile lock");
            woken =
                self.config
                    .degrade("wait_signal", self.store.wait_signal(&signal, timeout), || false)?;
        }
    }

    /// Releases the lock on `key`: removes the holder's marker if the value
    /// never landed and nobody else claimed the key since, then wakes one
    /// waiter. Safe to call more than once.
    pub fn release_lock(&self, key: &str, token: &LockToken) -> CacheResult<()> {
        let released = self.config.degrade(
            "release_lock",
            self.store
                .release_lock(key, token.marker(), &signal_key(key), SIGNAL_TTL),
            || false,
        )?;
        if released {
            debug!(key, "Dogpile lock released without a value");
        }
        Ok(())
    }
}

/// Releases a held lock when dropped, so a panicking or failing computation
/// never leaves waiters blocked for the full timeout.
pub(crate) struct LockRelease<'a> {
    dogpile: &'a Dogpile,
    key: &'a str,
    token: LockToken,
}

impl<'a> LockRelease<'a> {
    pub(crate) fn new(dogpile: &'a Dogpile, key: &'a str, token: LockToken) -> Self {
        Self {
            dogpile,
            key,
            token,
        }
    }
}

impl Drop for LockRelease<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.dogpile.release_lock(self.key, &self.token) {
            warn!(key = self.key, error = %err, "Failed to release dogpile lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use crate::infra::store::MemoryStore;

    use super::*;

    fn dogpile(timeout: Duration) -> (Arc<MemoryStore>, Arc<Dogpile>) {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(CacheConfig::default().with_lock_timeout(timeout));
        let coordinator = Arc::new(Coordinator::new(store.clone(), config.clone()));
        let dogpile = Arc::new(Dogpile::new(store.clone(), coordinator, config));
        (store, dogpile)
    }

    fn acquire(dogpile: &Dogpile, key: &str, timeout: Duration) -> LockToken {
        match dogpile.read_or_lock("", key, &Dnf::new(), timeout).unwrap() {
            LockOutcome::Acquired(token) => token,
            LockOutcome::Hit(_) => panic!("expected to acquire the lock on {key}"),
        }
    }

    #[test]
    fn first_reader_acquires_then_sees_value() {
        let (store, dogpile) = dogpile(Duration::from_secs(1));
        let timeout = Duration::from_secs(1);

        let token = acquire(&dogpile, "q:1", timeout);
        assert!(token.marker().starts_with(LOCK_MARKER));
        store.set("q:1", b"value", None).unwrap();
        dogpile.release_lock("q:1", &token).unwrap();
        dogpile.release_lock("q:1", &token).unwrap();

        assert_eq!(
            dogpile.read_or_lock("", "q:1", &Dnf::new(), timeout).unwrap(),
            LockOutcome::Hit(Bytes::from_static(b"value"))
        );
    }

    #[test]
    fn release_without_value_clears_marker() {
        let (store, dogpile) = dogpile(Duration::from_secs(1));
        let token = acquire(&dogpile, "q:1", Duration::from_secs(1));
        dogpile.release_lock("q:1", &token).unwrap();
        assert!(!store.exists("q:1").unwrap());
    }

    #[test]
    fn stale_holder_keeps_its_hands_off_a_new_lock() {
        let timeout = Duration::from_millis(30);
        let (store, dogpile) = dogpile(timeout);

        let stale = acquire(&dogpile, "q:1", timeout);
        thread::sleep(Duration::from_millis(60));
        let current = acquire(&dogpile, "q:1", Duration::from_secs(5));
        assert_ne!(stale, current);

        dogpile.release_lock("q:1", &stale).unwrap();
        assert_eq!(
            store.get("q:1").unwrap().as_deref(),
            Some(current.marker())
        );

        dogpile.release_lock("q:1", &current).unwrap();
        assert!(!store.exists("q:1").unwrap());
    }

    #[test]
    fn waiters_wake_when_holder_releases() {
        let (store, dogpile) = dogpile(Duration::from_secs(5));
        let token = acquire(&dogpile, "q:1", Duration::from_secs(5));

        let hits = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let dogpile = Arc::clone(&dogpile);
                let hits = Arc::clone(&hits);
                thread::spawn(move || {
                    let outcome = dogpile
                        .read_or_lock("", "q:1", &Dnf::new(), Duration::from_secs(5))
                        .unwrap();
                    if matches!(outcome, LockOutcome::Hit(_)) {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        store.set("q:1", b"value", None).unwrap();
        dogpile.release_lock("q:1", &token).unwrap();

        for waiter in waiters {
            waiter.join().expect("waiter thread");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn leftover_token_does_not_spin_a_waiter() {
        let (store, dogpile) = dogpile(Duration::from_secs(5));
        let token = acquire(&dogpile, "q:1", Duration::from_secs(5));
        // A relay that landed after the holder cleared the signal list.
        store.push_signal("q:1:signal", Duration::from_secs(1)).unwrap();

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let waiter = {
            let dogpile = Arc::clone(&dogpile);
            thread::spawn(move || {
                metrics::with_local_recorder(&recorder, || {
                    dogpile
                        .read_or_lock("", "q:1", &Dnf::new(), Duration::from_secs(5))
                        .unwrap()
                })
            })
        };

        thread::sleep(Duration::from_millis(200));
        store.set("q:1", b"value", None).unwrap();
        dogpile.release_lock("q:1", &token).unwrap();

        assert_eq!(
            waiter.join().expect("waiter thread"),
            LockOutcome::Hit(Bytes::from_static(b"value"))
        );
        let waits: u64 = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == "granule_cache_lock_wait_total")
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(count) => count,
                _ => 0,
            })
            .sum();
        assert!(waits <= 3, "waiter polled {waits} times");
    }

    #[test]
    fn crashed_holder_is_recovered_after_timeout() {
        let timeout = Duration::from_millis(100);
        let (_store, dogpile) = dogpile(timeout);

        // Holder never releases.
        acquire(&dogpile, "q:1", timeout);

        let started = Instant::now();
        acquire(&dogpile, "q:1", timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn guard_releases_on_drop() {
        let (store, dogpile) = dogpile(Duration::from_secs(1));
        let token = acquire(&dogpile, "q:1", Duration::from_secs(1));
        drop(LockRelease::new(&dogpile, "q:1", token));
        assert!(!store.exists("q:1").unwrap());
        assert!(store.exists("q:1:signal").unwrap());
    }
}
