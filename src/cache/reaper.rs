//! Garbage collection of conjunction sets.
//!
//! Entries expire on their own but their registrations stay behind in the
//! conjunction sets until the set itself expires or is invalidated. Hot sets
//! under persistent invalidators grow without bound; the reaper prunes members
//! whose entry no longer exists.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info};

use crate::error::CacheResult;
use crate::infra::store::{CacheStore, StoreError};
use crate::query::conj;

use super::config::CacheConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Conjunction keys inspected.
    pub scanned: usize,
    /// Sets that had at least one dead member removed.
    pub reaped_sets: usize,
    pub removed_members: usize,
}

pub struct Reaper {
    store: Arc<dyn CacheStore>,
    config: Arc<CacheConfig>,
}

impl Reaper {
    pub fn new(store: Arc<dyn CacheStore>, config: Arc<CacheConfig>) -> Self {
        Self { store, config }
    }

    /// Prunes dead members from every conjunction set under `prefix` holding
    /// at least `min_size` members.
    pub fn reap(&self, prefix: &str, min_size: usize) -> CacheResult<ReapReport> {
        let mut report = ReapReport::default();
        // Stamped conjunction keys are plain strings with nothing to prune.
        if self.config.stamped {
            return Ok(report);
        }

        let conj_keys = self.config.degrade(
            "scan_match",
            self.store.scan_match(&conj::all_conj_pattern(prefix)),
            Vec::new,
        )?;

        for conj_key in conj_keys {
            report.scanned += 1;

            let size = match self.store.scard(&conj_key) {
                Ok(size) => size,
                Err(StoreError::WrongType { .. }) => continue,
                Err(err) => return self.config.degrade("scard", Err(err), || report),
            };
            if size < min_size.max(1) {
                continue;
            }

            let members = self.config.degrade("smembers", self.store.smembers(&conj_key), Vec::new)?;
            let mut dead = Vec::new();
            for member in members {
                if !self.config.degrade("exists", self.store.exists(&member), || true)? {
                    dead.push(member);
                }
            }
            if dead.is_empty() {
                continue;
            }

            let removed = self.config.degrade("srem", self.store.srem(&conj_key, &dead), || 0)?;
            debug!(conj_key = %conj_key, removed, "Reaped conjunction set");
            report.reaped_sets += 1;
            report.removed_members += removed;
        }

        counter!("granule_reap_removed_total").increment(report.removed_members as u64);
        info!(
            prefix,
            scanned = report.scanned,
            reaped_sets = report.reaped_sets,
            removed_members = report.removed_members,
            "Reaped conjunction sets"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crate::infra::store::{ConjRegistration, EntryWrite, MemoryStore};

    use super::*;

    fn register(store: &MemoryStore, key: &str, conj_key: &str, ttl: Duration) {
        let regs = [ConjRegistration {
            conj_key: conj_key.to_string(),
            scheme_key: "schemes:post".to_string(),
            scheme: "id".to_string(),
        }];
        store
            .cache_entry(&EntryWrite {
                key,
                value: b"v",
                ttl,
                registrations: &regs,
                precall_key: None,
                conj_ttl: None,
            })
            .unwrap();
    }

    #[test]
    fn removes_members_whose_entries_expired() {
        let store = Arc::new(MemoryStore::new());
        register(&store, "q:1", "conj:post:id=1", Duration::from_millis(10));
        register(&store, "q:2", "conj:post:id=1", Duration::from_secs(60));
        register(&store, "q:3", "conj:post:id=2", Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));

        let reaper = Reaper::new(store.clone(), Arc::new(CacheConfig::default()));
        let report = reaper.reap("", 1).unwrap();

        assert_eq!(
            report,
            ReapReport {
                scanned: 2,
                reaped_sets: 2,
                removed_members: 2,
            }
        );
        assert_eq!(store.smembers("conj:post:id=1").unwrap(), vec!["q:2".to_string()]);
        // A set emptied by reaping disappears.
        assert!(!store.exists("conj:post:id=2").unwrap());
    }

    #[test]
    fn small_sets_are_left_alone() {
        let store = Arc::new(MemoryStore::new());
        register(&store, "q:1", "conj:post:id=1", Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));

        let reaper = Reaper::new(store.clone(), Arc::new(CacheConfig::default()));
        let report = reaper.reap("", 5).unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.removed_members, 0);
        assert_eq!(store.scard("conj:post:id=1").unwrap(), 1);
    }
}
