//! Invalidation: from a changed row to the entries it could affect.
//!
//! Every conjunction shape a table was ever cached under is recorded as a
//! scheme. A changed row is projected onto each scheme it fully covers; each
//! projection names exactly one conjunction key, and the entries registered
//! there are the ones whose conditions the row satisfies.
//!
//! The scheme read is not atomic with the delete: a scheme registered in
//! between belongs to an entry written after this row change, which already
//! saw the new data.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use metrics::counter;
use tracing::debug;

use crate::error::CacheResult;
use crate::infra::store::CacheStore;
use crate::query::{Conjunction, Row, conj};

use super::config::CacheConfig;
use super::events::{ALL_TABLES, EventBus};

const DELETE_BATCH: usize = 100;

thread_local! {
    static SUPPRESSION_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Suspends invalidation on the current thread until dropped.
///
/// Guards nest; invalidation resumes when the outermost one is dropped.
#[must_use = "invalidation resumes as soon as the guard is dropped"]
pub fn no_invalidation() -> SuppressionGuard {
    SUPPRESSION_DEPTH.with(|depth| depth.set(depth.get() + 1));
    SuppressionGuard {
        _not_send: PhantomData,
    }
}

pub fn is_suppressed() -> bool {
    SUPPRESSION_DEPTH.with(|depth| depth.get() > 0)
}

pub struct SuppressionGuard {
    // The depth is thread-local; the guard must be dropped where it was made.
    _not_send: PhantomData<*const ()>,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        SUPPRESSION_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub struct Invalidator {
    store: Arc<dyn CacheStore>,
    config: Arc<CacheConfig>,
    events: Arc<EventBus>,
}

impl Invalidator {
    pub fn new(store: Arc<dyn CacheStore>, config: Arc<CacheConfig>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Deletes every entry of `table` whose conjunctions `row` satisfies.
    /// Returns how many entries were deleted.
    pub fn invalidate_by_fields(&self, prefix: &str, table: &str, row: &Row) -> CacheResult<usize> {
        if is_suppressed() {
            return Ok(0);
        }

        let schemes = self.config.degrade(
            "smembers",
            self.store.smembers(&conj::scheme_key(prefix, table)),
            Vec::new,
        )?;
        let conj_keys = conj_keys_for_row(prefix, table, row, &schemes);

        let deleted = self.delete(&conj_keys)?;
        debug!(table, conjunctions = conj_keys.len(), deleted, "Invalidated by fields");
        counter!("granule_invalidation_total", "kind" => "fields").increment(1);
        self.events.publish(table, Some(row.clone()));
        Ok(deleted)
    }

    /// Deletes every entry registered under any conjunction of `table`.
    pub fn invalidate_by_table(&self, prefix: &str, table: &str) -> CacheResult<usize> {
        if is_suppressed() {
            return Ok(0);
        }

        let conj_keys = self.config.degrade(
            "scan_match",
            self.store.scan_match(&conj::conj_pattern(prefix, table)),
            Vec::new,
        )?;
        let mut deleted = 0;
        for batch in conj_keys.chunks(DELETE_BATCH) {
            deleted += self.delete(batch)?;
        }

        debug!(table, conjunctions = conj_keys.len(), deleted, "Invalidated table");
        counter!("granule_invalidation_total", "kind" => "table").increment(1);
        self.events.publish(table, None);
        Ok(deleted)
    }

    /// Drops the whole store namespace.
    pub fn invalidate_all(&self) -> CacheResult<()> {
        if is_suppressed() {
            return Ok(());
        }

        self.config.degrade("flush", self.store.flush(), || ())?;
        counter!("granule_invalidation_total", "kind" => "all").increment(1);
        self.events.publish(ALL_TABLES, None);
        Ok(())
    }

    /// Plain mode deletes the registered entries with their sets; stamped mode
    /// only deletes the stamps, which turns every dependent entry stale.
    fn delete(&self, conj_keys: &[String]) -> CacheResult<usize> {
        if conj_keys.is_empty() {
            return Ok(0);
        }
        if self.config.stamped {
            self.config.degrade("del", self.store.del(conj_keys), || 0)
        } else {
            self.config.degrade(
                "delete_conjunctions",
                self.store.delete_conjunctions(conj_keys),
                || 0,
            )
        }
    }
}

/// Conjunction keys a changed row hits, given the table's known schemes.
///
/// The unconditional key is always included. Schemes naming a field the row
/// does not carry are skipped.
pub fn conj_keys_for_row(prefix: &str, table: &str, row: &Row, schemes: &[String]) -> Vec<String> {
    let mut keys = vec![conj::conj_key(prefix, table, &Conjunction::new())];
    for scheme in schemes {
        let projection: Option<Conjunction> = conj::scheme_fields(scheme)
            .into_iter()
            .map(|field| row.get(field).map(|value| (field.to_string(), value.clone())))
            .collect();
        if let Some(projection) = projection {
            let key = conj::conj_key(prefix, table, &projection);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::infra::store::{ConjRegistration, EntryWrite, MemoryStore};
    use crate::query::Value;

    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(field, value)| (field.to_string(), value.clone()))
            .collect()
    }

    fn register(store: &MemoryStore, key: &str, conj_key: &str, scheme: &str) {
        let regs = [ConjRegistration {
            conj_key: conj_key.to_string(),
            scheme_key: "schemes:post".to_string(),
            scheme: scheme.to_string(),
        }];
        store
            .cache_entry(&EntryWrite {
                key,
                value: b"v",
                ttl: Duration::from_secs(60),
                registrations: &regs,
                precall_key: None,
                conj_ttl: None,
            })
            .unwrap();
    }

    fn invalidator(store: Arc<MemoryStore>) -> Invalidator {
        Invalidator::new(
            store,
            Arc::new(CacheConfig::default()),
            Arc::new(EventBus::default()),
        )
    }

    #[test]
    fn row_projects_onto_covered_schemes() {
        let schemes = vec![
            "id".to_string(),
            "author_id,category".to_string(),
            "slug".to_string(),
        ];
        let changed = row(&[
            ("id", Value::Int(5)),
            ("author_id", Value::Int(2)),
            ("category", Value::from("news")),
        ]);

        let keys = conj_keys_for_row("", "post", &changed, &schemes);
        assert_eq!(
            keys,
            vec![
                "conj:post:".to_string(),
                "conj:post:id=5".to_string(),
                "conj:post:author_id=2&category=news".to_string(),
            ]
        );
    }

    #[test]
    fn deletes_only_matching_entries() {
        let store = Arc::new(MemoryStore::new());
        register(&store, "q:5", "conj:post:id=5", "id");
        register(&store, "q:6", "conj:post:id=6", "id");
        register(&store, "q:all", "conj:post:", "");

        let invalidator = invalidator(store.clone());
        let deleted = invalidator
            .invalidate_by_fields("", "post", &row(&[("id", Value::Int(5))]))
            .unwrap();

        assert_eq!(deleted, 2);
        assert!(!store.exists("q:5").unwrap());
        assert!(!store.exists("q:all").unwrap());
        assert!(store.exists("q:6").unwrap());
        // Schemes survive invalidation.
        assert_eq!(store.scard("schemes:post").unwrap(), 2);
    }

    #[test]
    fn table_invalidation_clears_every_conjunction() {
        let store = Arc::new(MemoryStore::new());
        register(&store, "q:5", "conj:post:id=5", "id");
        register(&store, "q:6", "conj:post:id=6", "id");

        let deleted = invalidator(store.clone())
            .invalidate_by_table("", "post")
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.scan_match("conj:post:*").unwrap().is_empty());
    }

    #[test]
    fn suppression_nests_and_restores() {
        let store = Arc::new(MemoryStore::new());
        register(&store, "q:5", "conj:post:id=5", "id");
        let invalidator = invalidator(store.clone());
        let changed = row(&[("id", Value::Int(5))]);

        {
            let _outer = no_invalidation();
            {
                let _inner = no_invalidation();
                assert!(is_suppressed());
            }
            assert!(is_suppressed());
            assert_eq!(invalidator.invalidate_by_fields("", "post", &changed).unwrap(), 0);
            assert!(store.exists("q:5").unwrap());
        }

        assert!(!is_suppressed());
        assert_eq!(invalidator.invalidate_by_fields("", "post", &changed).unwrap(), 1);
    }

    #[test]
    fn events_are_published() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let invalidator = Invalidator::new(store, Arc::new(CacheConfig::default()), events);

        invalidator
            .invalidate_by_fields("", "post", &row(&[("id", Value::Int(1))]))
            .unwrap();
        invalidator.invalidate_all().unwrap();

        assert_eq!(rx.try_recv().expect("fields event").table, "post");
        assert!(rx.try_recv().expect("flush event").is_full_flush());
    }
}
