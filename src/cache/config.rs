//! Runtime cache configuration.
//!
//! Built from [`CacheSettings`] and shared by every engine component.

use std::num::NonZeroUsize;
use std::time::Duration;

use tracing::warn;

use crate::config::CacheSettings;
use crate::error::{CacheError, CacheResult};
use crate::infra::store::StoreResult;
use crate::query::{PrefixPolicy, TranslateOptions};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub translate: TranslateOptions,
    pub persistent_invalidators: bool,
    pub conj_ttl_margin: Duration,
    /// Swallow store connectivity failures instead of propagating them.
    pub degrade_on_failure: bool,
    pub lock_timeout: Duration,
    pub stamped: bool,
    pub reap_threshold: NonZeroUsize,
    pub local_capacity: NonZeroUsize,
    pub prefix: PrefixPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            translate: TranslateOptions {
                long_disjunction: settings.long_disjunction.get(),
                untrackable: settings.untrackable_kinds.iter().cloned().collect(),
            },
            persistent_invalidators: settings.persistent_invalidators,
            conj_ttl_margin: settings.conj_ttl_margin,
            degrade_on_failure: settings.degrade_on_failure,
            lock_timeout: settings.lock_timeout,
            stamped: settings.stamped,
            reap_threshold: settings.reap_threshold,
            local_capacity: settings.local_capacity,
            prefix: PrefixPolicy::None,
        }
    }
}

impl CacheConfig {
    pub fn with_prefix(mut self, prefix: PrefixPolicy) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_stamped(mut self, stamped: bool) -> Self {
        self.stamped = stamped;
        self
    }

    pub fn with_degrade_on_failure(mut self, degrade: bool) -> Self {
        self.degrade_on_failure = degrade;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Lifetime a conjunction must outlive an entry of `ttl` by; `None` when
    /// invalidators are persistent.
    pub fn conj_ttl(&self, ttl: Duration) -> Option<Duration> {
        (!self.persistent_invalidators).then(|| ttl.saturating_mul(2) + self.conj_ttl_margin)
    }

    /// Applies the degrade policy to a store result.
    ///
    /// Only connectivity failures are swallowed; they are logged and replaced
    /// with `fallback`.
    pub(crate) fn degrade<T>(
        &self,
        op: &'static str,
        result: StoreResult<T>,
        fallback: impl FnOnce() -> T,
    ) -> CacheResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let err = CacheError::store(op, err);
                if self.degrade_on_failure && err.is_unavailable() {
                    warn!(op, error = %err, "Cache store unavailable; degrading");
                    Ok(fallback())
                } else {
                    Err(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::infra::store::StoreError;

    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.translate.long_disjunction, 8);
        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert!(!config.stamped);
        assert!(!config.degrade_on_failure);
    }

    #[test]
    fn conj_ttl_doubles_and_adds_margin() {
        let config = CacheConfig::default();
        assert_eq!(
            config.conj_ttl(Duration::from_secs(60)),
            Some(Duration::from_secs(130))
        );

        let persistent = CacheConfig {
            persistent_invalidators: true,
            ..CacheConfig::default()
        };
        assert_eq!(persistent.conj_ttl(Duration::from_secs(60)), None);
    }

    #[test]
    fn degrade_swallows_only_unavailability() {
        let config = CacheConfig::default().with_degrade_on_failure(true);
        let unavailable: StoreResult<u8> = Err(StoreError::Unavailable("down".into()));
        assert_eq!(config.degrade("get", unavailable, || 0).unwrap(), 0);

        let wrong_type: StoreResult<u8> = Err(StoreError::WrongType { key: "k".into() });
        assert!(config.degrade("get", wrong_type, || 0).is_err());

        let strict = CacheConfig::default();
        let unavailable: StoreResult<u8> = Err(StoreError::Unavailable("down".into()));
        assert!(strict.degrade("get", unavailable, || 0).unwrap_err().is_unavailable());
    }
}
