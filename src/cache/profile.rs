//! Per-table cache profiles.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{CacheSettings, ProfileSettings};
use crate::error::{CacheError, CacheResult};

/// Read operation a profile may opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheOp {
    Get,
    Fetch,
    Count,
    Aggregate,
    Exists,
}

impl CacheOp {
    pub const ALL: [CacheOp; 5] = [
        CacheOp::Get,
        CacheOp::Fetch,
        CacheOp::Count,
        CacheOp::Aggregate,
        CacheOp::Exists,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheOp::Get => "get",
            CacheOp::Fetch => "fetch",
            CacheOp::Count => "count",
            CacheOp::Aggregate => "aggregate",
            CacheOp::Exists => "exists",
        }
    }
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheOp {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        CacheOp::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown cache operation `{value}`"))
    }
}

/// Resolved caching behaviour for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheProfile {
    pub timeout: Duration,
    pub ops: BTreeSet<CacheOp>,
    /// Serialize recomputation through the dogpile lock.
    pub lock: bool,
    /// Keep `get` results in the in-process LRU as well.
    pub local_get: bool,
    /// Cache keys and prefixes ignore which database served the query.
    pub db_agnostic: bool,
}

impl CacheProfile {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ops: CacheOp::ALL.into_iter().collect(),
            lock: false,
            local_get: false,
            db_agnostic: true,
        }
    }

    pub fn with_ops(mut self, ops: impl IntoIterator<Item = CacheOp>) -> Self {
        self.ops = ops.into_iter().collect();
        self
    }

    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_local_get(mut self, local_get: bool) -> Self {
        self.local_get = local_get;
        self
    }

    pub fn with_db_agnostic(mut self, db_agnostic: bool) -> Self {
        self.db_agnostic = db_agnostic;
        self
    }

    pub fn caches(&self, op: CacheOp) -> bool {
        self.ops.contains(&op)
    }

    fn from_settings(
        name: &str,
        settings: &ProfileSettings,
        default_timeout: Option<Duration>,
    ) -> CacheResult<Self> {
        let timeout = settings.timeout.or(default_timeout).ok_or_else(|| {
            CacheError::configuration(format!(
                "profile `{name}` has no timeout and no default timeout is configured"
            ))
        })?;

        Ok(Self {
            timeout,
            ops: settings.ops.clone(),
            lock: settings.lock,
            local_get: settings.local_get,
            db_agnostic: settings.db_agnostic,
        })
    }
}

/// Profiles keyed by `app.model`, `app.*` or `*`.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, CacheProfile>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &CacheSettings) -> CacheResult<Self> {
        let mut registry = Self::new();
        for (name, profile) in &settings.profiles {
            registry.insert(
                name.clone(),
                CacheProfile::from_settings(name, profile, settings.default_timeout)?,
            );
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, profile: CacheProfile) {
        self.profiles.insert(name.into(), profile);
    }

    pub fn with(mut self, name: impl Into<String>, profile: CacheProfile) -> Self {
        self.insert(name, profile);
        self
    }

    /// Exact name first, then `app.*` for `app.model`, then `*`.
    pub fn lookup(&self, table: &str) -> Option<&CacheProfile> {
        if let Some(profile) = self.profiles.get(table) {
            return Some(profile);
        }
        if let Some((app, _)) = table.split_once('.') {
            if let Some(profile) = self.profiles.get(&format!("{app}.*")) {
                return Some(profile);
            }
        }
        self.profiles.get("*")
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_prefers_exact_then_app_then_wildcard() {
        let registry = ProfileRegistry::new()
            .with("blog.post", CacheProfile::new(Duration::from_secs(1)))
            .with("blog.*", CacheProfile::new(Duration::from_secs(2)))
            .with("*", CacheProfile::new(Duration::from_secs(3)));

        let timeout = |table: &str| registry.lookup(table).map(|p| p.timeout.as_secs());
        assert_eq!(timeout("blog.post"), Some(1));
        assert_eq!(timeout("blog.comment"), Some(2));
        assert_eq!(timeout("shop.order"), Some(3));
        assert_eq!(timeout("plain_table"), Some(3));
    }

    #[test]
    fn lookup_misses_without_wildcard() {
        let registry =
            ProfileRegistry::new().with("blog.*", CacheProfile::new(Duration::from_secs(2)));
        assert!(registry.lookup("shop.order").is_none());
    }

    #[test]
    fn profile_without_timeout_needs_default() {
        let mut settings = CacheSettings::default();
        settings.profiles.insert(
            "blog.post".to_string(),
            ProfileSettings {
                timeout: None,
                ops: BTreeSet::from([CacheOp::Get]),
                lock: false,
                local_get: false,
                db_agnostic: true,
            },
        );

        let err = ProfileRegistry::from_settings(&settings).expect_err("missing timeout");
        assert!(matches!(err, CacheError::Configuration { .. }));

        settings.default_timeout = Some(Duration::from_secs(30));
        let registry = ProfileRegistry::from_settings(&settings).expect("valid profiles");
        let profile = registry.lookup("blog.post").expect("profile");
        assert_eq!(profile.timeout, Duration::from_secs(30));
        assert!(profile.caches(CacheOp::Get));
        assert!(!profile.caches(CacheOp::Count));
    }

    #[test]
    fn ops_parse_case_insensitively() {
        assert_eq!("Fetch".parse::<CacheOp>(), Ok(CacheOp::Fetch));
        assert!("scan".parse::<CacheOp>().is_err());
    }
}
