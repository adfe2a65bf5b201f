//! The cache engine: the explicit API the data-access layer calls.
//!
//! Reads go through [`Engine::cached_read`] (one query) or
//! [`Engine::cached_call`] (any computation depending on explicit queries).
//! Writes report the changed rows through [`Engine::row_saved`],
//! [`Engine::row_deleted`] and [`Engine::bulk_changed`]; those are deferred to
//! the commit of the enclosing transaction.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::{CacheSettings, Settings};
use crate::error::{CacheError, CacheResult};
use crate::infra::store::{CacheStore, MemoryStore};
use crate::query::{Dnf, PrefixContext, Query, Row, translate};
use crate::transaction;

use super::config::CacheConfig;
use super::coordinator::{Coordinator, WriteOutcome, WriteRequest};
use super::dogpile::{Dogpile, LockOutcome, LockRelease};
use super::events::{EventBus, InvalidationEvent};
use super::invalidator::{self, Invalidator};
use super::local::LocalCache;
use super::profile::{CacheOp, ProfileRegistry};
use super::reaper::{ReapReport, Reaper};

const PRECALL_SUFFIX: &str = ":precall";

/// One cacheable query read.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest<'a> {
    /// Connection alias the query runs on.
    pub db: &'a str,
    pub query: &'a Query,
    /// Stable rendering of the full query, parameters included.
    pub signature: &'a str,
    pub op: CacheOp,
    /// Overrides the profile timeout.
    pub timeout: Option<Duration>,
    /// Drop the computed value if an invalidation lands while computing.
    pub keep_fresh: bool,
}

impl<'a> ReadRequest<'a> {
    pub fn new(db: &'a str, query: &'a Query, signature: &'a str, op: CacheOp) -> Self {
        Self {
            db,
            query,
            signature,
            op,
            timeout: None,
            keep_fresh: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_keep_fresh(mut self, keep_fresh: bool) -> Self {
        self.keep_fresh = keep_fresh;
        self
    }
}

/// A cached computation that depends on explicit queries.
#[derive(Debug, Clone, Copy)]
pub struct CallRequest<'a> {
    /// Identity of the computation, e.g. a module path.
    pub function: &'a str,
    /// Stable rendering of the arguments.
    pub args: &'a str,
    pub dependencies: &'a [Query],
    /// Connections the dependencies are read through.
    pub dbs: &'a [String],
    pub timeout: Duration,
    pub lock: bool,
    pub keep_fresh: bool,
}

/// Everything needed to serve one read once it is known to be cacheable.
#[derive(Debug)]
struct Plan {
    prefix: String,
    key: String,
    dnf: Dnf,
    ttl: Duration,
    dbs: Vec<String>,
    lock: bool,
    local: bool,
    keep_fresh: bool,
}

pub struct Engine {
    config: Arc<CacheConfig>,
    profiles: ProfileRegistry,
    coordinator: Arc<Coordinator>,
    dogpile: Dogpile,
    invalidator: Arc<Invalidator>,
    reaper: Reaper,
    local: Arc<LocalCache>,
    events: Arc<EventBus>,
}

impl Engine {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig, profiles: ProfileRegistry) -> Self {
        let config = Arc::new(config);
        let events = Arc::new(EventBus::default());
        let coordinator = Arc::new(Coordinator::new(store.clone(), config.clone()));
        let dogpile = Dogpile::new(store.clone(), coordinator.clone(), config.clone());
        let invalidator = Arc::new(Invalidator::new(
            store.clone(),
            config.clone(),
            events.clone(),
        ));
        let reaper = Reaper::new(store, config.clone());
        let local = Arc::new(LocalCache::new(config.local_capacity));

        Self {
            config,
            profiles,
            coordinator,
            dogpile,
            invalidator,
            reaper,
            local,
            events,
        }
    }

    pub fn from_settings(store: Arc<dyn CacheStore>, settings: &CacheSettings) -> CacheResult<Self> {
        let profiles = ProfileRegistry::from_settings(settings)?;
        Ok(Self::new(store, CacheConfig::from(settings), profiles))
    }

    /// Builds an engine over the store named by `settings.store`.
    pub fn open(settings: &Settings) -> CacheResult<Self> {
        let store: Arc<dyn CacheStore> = match settings.store.url.as_deref() {
            None => Arc::new(MemoryStore::new()),
            #[cfg(feature = "redis")]
            Some(url) => Arc::new(
                crate::infra::store::RedisStore::open(url)
                    .map_err(|err| CacheError::store("open", err))?,
            ),
            #[cfg(not(feature = "redis"))]
            Some(_) => {
                return Err(CacheError::configuration(
                    "store.url is set but granule was built without the `redis` feature",
                ));
            }
        };
        Self::from_settings(store, &settings.cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn dogpile(&self) -> &Dogpile {
        &self.dogpile
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.events.subscribe()
    }

    /// Serves a query read from cache, computing and storing it on a miss.
    ///
    /// Reads that are not cacheable (no profile, op not enabled, caching
    /// disabled, dirty transaction) call `compute` directly.
    pub fn cached_read<T, F>(&self, request: &ReadRequest<'_>, compute: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> CacheResult<T>,
    {
        match self.plan_read(request)? {
            Some(plan) => self.get_or_compute(&plan, compute),
            None => compute(),
        }
    }

    /// Caches an arbitrary computation, invalidated by any of its dependency
    /// queries.
    pub fn cached_call<T, F>(&self, request: &CallRequest<'_>, compute: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> CacheResult<T>,
    {
        if !self.config.enabled || transaction::is_dirty(request.dbs) {
            return compute();
        }

        let mut dnf = Dnf::new();
        let mut tables = Vec::new();
        for query in request.dependencies {
            dnf.merge(translate(query, &self.config.translate)?);
            for table in query.touched_tables() {
                if !tables.contains(&table) {
                    tables.push(table);
                }
            }
        }

        let ctx = PrefixContext {
            tables,
            dbs: request.dbs.to_vec(),
            function: Some(request.function.to_string()),
        };
        let prefix = self.config.prefix.resolve(&ctx)?;
        let key = format!(
            "{prefix}fn:{}",
            digest(&[request.function, request.args])
        );

        let plan = Plan {
            prefix,
            key,
            dnf,
            ttl: request.timeout,
            dbs: request.dbs.to_vec(),
            lock: request.lock,
            local: false,
            keep_fresh: request.keep_fresh,
        };
        self.get_or_compute(&plan, compute)
    }

    /// Reports a saved row. `old` is the row as it was before the save, when
    /// known; entries matching either version are invalidated.
    pub fn row_saved(&self, db: &str, table: &str, old: Option<&Row>, new: &Row) -> CacheResult<()> {
        let mut rows = vec![new.clone()];
        if let Some(old) = old.filter(|old| *old != new) {
            rows.push(old.clone());
        }
        self.queue_field_invalidation(db, table, rows)
    }

    pub fn row_deleted(&self, db: &str, table: &str, row: &Row) -> CacheResult<()> {
        self.queue_field_invalidation(db, table, vec![row.clone()])
    }

    /// Reports a change the host cannot describe row by row (bulk update,
    /// raw SQL); invalidates the whole table on commit.
    pub fn bulk_changed(&self, db: &str, table: &str) -> CacheResult<()> {
        if invalidator::is_suppressed() {
            return Ok(());
        }
        let prefix = self.row_prefix(db, table)?;
        let invalidator = Arc::clone(&self.invalidator);
        let local = Arc::clone(&self.local);
        let table = table.to_string();

        transaction::queue_or_run(
            db,
            Box::new(move || {
                invalidator.invalidate_by_table(&prefix, &table)?;
                local.clear();
                Ok(())
            }),
        )
    }

    /// Immediately invalidates a whole table, outside any transaction queue.
    pub fn invalidate_by_table(&self, db: &str, table: &str) -> CacheResult<usize> {
        let prefix = self.row_prefix(db, table)?;
        let deleted = self.invalidator.invalidate_by_table(&prefix, table)?;
        self.local.clear();
        Ok(deleted)
    }

    pub fn invalidate_all(&self) -> CacheResult<()> {
        self.invalidator.invalidate_all()?;
        self.local.clear();
        Ok(())
    }

    /// Prunes conjunction sets under `prefix` larger than the configured threshold.
    pub fn reap(&self, prefix: &str) -> CacheResult<ReapReport> {
        self.reaper.reap(prefix, self.config.reap_threshold.get())
    }

    pub fn reap_with_threshold(&self, prefix: &str, min_size: usize) -> CacheResult<ReapReport> {
        self.reaper.reap(prefix, min_size)
    }

    fn queue_field_invalidation(&self, db: &str, table: &str, rows: Vec<Row>) -> CacheResult<()> {
        if invalidator::is_suppressed() {
            return Ok(());
        }
        let prefix = self.row_prefix(db, table)?;
        let invalidator = Arc::clone(&self.invalidator);
        let local = Arc::clone(&self.local);
        let table = table.to_string();

        transaction::queue_or_run(
            db,
            Box::new(move || {
                for row in &rows {
                    invalidator.invalidate_by_fields(&prefix, &table, row)?;
                }
                local.clear();
                Ok(())
            }),
        )
    }

    fn row_prefix(&self, db: &str, table: &str) -> CacheResult<String> {
        self.config
            .prefix
            .resolve(&PrefixContext::for_query(vec![table.to_string()], db))
    }

    fn plan_read(&self, request: &ReadRequest<'_>) -> CacheResult<Option<Plan>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let Some(primary) = request.query.tables.first() else {
            return Ok(None);
        };
        let Some(profile) = self.profiles.lookup(&primary.table) else {
            return Ok(None);
        };
        if !profile.caches(request.op) {
            return Ok(None);
        }
        if transaction::is_dirty(&[request.db]) {
            debug!(db = request.db, table = %primary.table, "Bypassing cache in dirty transaction");
            return Ok(None);
        }

        let dnf = translate(request.query, &self.config.translate)?;
        let ctx = PrefixContext::for_query(request.query.touched_tables(), request.db);
        let prefix = self.config.prefix.resolve(&ctx)?;

        let op = request.op.as_str();
        let key = if profile.db_agnostic {
            digest(&[op, request.signature])
        } else {
            digest(&[op, request.db, request.signature])
        };

        Ok(Some(Plan {
            key: format!("{prefix}q:{key}"),
            prefix,
            dnf,
            ttl: request.timeout.unwrap_or(profile.timeout),
            dbs: vec![request.db.to_string()],
            lock: profile.lock,
            local: profile.local_get && request.op == CacheOp::Get,
            keep_fresh: request.keep_fresh,
        }))
    }

    fn get_or_compute<T, F>(&self, plan: &Plan, compute: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> CacheResult<T>,
    {
        if plan.local {
            if let Some(value) = self.local.get(&plan.key).and_then(|b| decode(&plan.key, &b)) {
                return Ok(value);
            }
        }

        if plan.lock {
            match self.dogpile.read_or_lock(
                &plan.prefix,
                &plan.key,
                &plan.dnf,
                self.config.lock_timeout,
            )? {
                LockOutcome::Hit(bytes) => {
                    if let Some(value) = self.hit(plan, bytes) {
                        return Ok(value);
                    }
                }
                LockOutcome::Acquired(token) => {
                    let _release = LockRelease::new(&self.dogpile, &plan.key, token);
                    return self.compute_and_store(plan, compute);
                }
            }
        } else if let Some(bytes) = self.coordinator.read(&plan.prefix, &plan.key, &plan.dnf)? {
            if let Some(value) = self.hit(plan, bytes) {
                return Ok(value);
            }
        }

        self.compute_and_store(plan, compute)
    }

    fn hit<T: DeserializeOwned>(&self, plan: &Plan, bytes: Bytes) -> Option<T> {
        let value = decode(&plan.key, &bytes)?;
        counter!("granule_cache_hit_total", "layer" => "store").increment(1);
        debug!(key = %plan.key, "Cache hit");
        if plan.local {
            self.local.put(&plan.key, bytes, plan.ttl);
        }
        Some(value)
    }

    fn compute_and_store<T, F>(&self, plan: &Plan, compute: F) -> CacheResult<T>
    where
        T: Serialize,
        F: FnOnce() -> CacheResult<T>,
    {
        counter!("granule_cache_miss_total").increment(1);
        debug!(key = %plan.key, "Cache miss");

        let precall_key = format!("{}{PRECALL_SUFFIX}", plan.key);
        let mut precall = None;
        let mut expected_checksum = None;
        if plan.keep_fresh {
            if self.config.stamped {
                expected_checksum =
                    self.coordinator
                        .snapshot_checksum(&plan.prefix, &plan.dnf, plan.ttl)?;
            } else {
                // Registered like an entry, so an invalidation while computing
                // deletes it and the final write is skipped.
                let marked = self.coordinator.write(&WriteRequest {
                    prefix: &plan.prefix,
                    key: &precall_key,
                    value: b"",
                    dnf: &plan.dnf,
                    ttl: plan.ttl,
                    dbs: &plan.dbs,
                    precall_key: None,
                    expected_checksum: None,
                })?;
                if marked.is_stored() {
                    precall = Some(precall_key.as_str());
                }
            }
        }

        let value = compute()?;
        let payload = serde_json::to_vec(&value)?;

        let outcome = self.coordinator.write(&WriteRequest {
            prefix: &plan.prefix,
            key: &plan.key,
            value: &payload,
            dnf: &plan.dnf,
            ttl: plan.ttl,
            dbs: &plan.dbs,
            precall_key: precall,
            expected_checksum: expected_checksum.as_deref(),
        })?;
        if outcome == WriteOutcome::Stored && plan.local {
            self.local.put(&plan.key, Bytes::from(payload), plan.ttl);
        }
        Ok(value)
    }
}

/// Hex SHA-256 over NUL-separated parts.
fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Option<T> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "Discarding undecodable cache entry");
            None
        }
    }
}
