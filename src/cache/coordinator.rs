//! Cache write and read protocol.
//!
//! A write stores the value together with its registrations under every
//! conjunction of its DNF in one atomic store step, so an entry is never
//! visible without the registrations that make it invalidatable.
//!
//! In stamped mode conjunction keys hold random stamps instead of member sets.
//! Stored values are framed as `checksum \n payload`; a read recomputes the
//! checksum from the current stamps and treats any difference as a miss.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CacheResult;
use crate::infra::store::{CacheStore, ConjRegistration, EntryWrite};
use crate::query::{Dnf, conj};
use crate::transaction;

use super::config::CacheConfig;

/// Sentinel occupying a cache key while its value is being computed.
/// Prefix of every dogpile lock marker; each holder appends its own token.
pub(crate) const LOCK_MARKER: &[u8] = b"__granule:lock__";
const CHECKSUM_SEPARATOR: u8 = b'\n';

#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    pub prefix: &'a str,
    pub key: &'a str,
    pub value: &'a [u8],
    pub dnf: &'a Dnf,
    pub ttl: Duration,
    /// Connections the value was read through.
    pub dbs: &'a [String],
    /// Write only while this key still exists.
    pub precall_key: Option<&'a str>,
    /// Stamped mode: write only if the stamps still hash to this checksum.
    pub expected_checksum: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// A connection involved has uncommitted writes.
    SkippedDirty,
    /// The precall key was invalidated while the value was computed.
    SkippedPrecall,
    /// The stamps changed since the expected checksum was taken.
    SkippedChecksum,
    /// The store was unreachable and the degrade policy swallowed it.
    SkippedUnavailable,
}

impl WriteOutcome {
    pub fn is_stored(self) -> bool {
        self == WriteOutcome::Stored
    }

    fn reason(self) -> &'static str {
        match self {
            WriteOutcome::Stored => "stored",
            WriteOutcome::SkippedDirty => "dirty",
            WriteOutcome::SkippedPrecall => "precall",
            WriteOutcome::SkippedChecksum => "checksum",
            WriteOutcome::SkippedUnavailable => "unavailable",
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn CacheStore>,
    config: Arc<CacheConfig>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn CacheStore>, config: Arc<CacheConfig>) -> Self {
        Self { store, config }
    }

    pub fn write(&self, request: &WriteRequest<'_>) -> CacheResult<WriteOutcome> {
        if transaction::is_dirty(request.dbs) {
            return Ok(self.skipped(request.key, WriteOutcome::SkippedDirty));
        }

        let registrations = registrations(request.prefix, request.dnf);
        let conj_ttl = self.config.conj_ttl(request.ttl);

        let stored = if self.config.stamped {
            let fresh = Uuid::new_v4().simple().to_string();
            let stamps = self.config.degrade(
                "ensure_stamps",
                self.store
                    .ensure_stamps(&registrations, &fresh, conj_ttl)
                    .map(Some),
                || None,
            )?;
            let Some(stamps) = stamps else {
                return Ok(self.skipped(request.key, WriteOutcome::SkippedUnavailable));
            };

            let checksum = checksum(&stamps);
            if request
                .expected_checksum
                .is_some_and(|expected| expected != checksum)
            {
                return Ok(self.skipped(request.key, WriteOutcome::SkippedChecksum));
            }

            let mut framed = Vec::with_capacity(checksum.len() + 1 + request.value.len());
            framed.extend_from_slice(checksum.as_bytes());
            framed.push(CHECKSUM_SEPARATOR);
            framed.extend_from_slice(request.value);

            self.cache_entry(&EntryWrite {
                key: request.key,
                value: &framed,
                ttl: request.ttl,
                registrations: &[],
                precall_key: request.precall_key,
                conj_ttl: None,
            })?
        } else {
            self.cache_entry(&EntryWrite {
                key: request.key,
                value: request.value,
                ttl: request.ttl,
                registrations: &registrations,
                precall_key: request.precall_key,
                conj_ttl,
            })?
        };

        let outcome = match stored {
            Some(true) => WriteOutcome::Stored,
            Some(false) => WriteOutcome::SkippedPrecall,
            None => WriteOutcome::SkippedUnavailable,
        };
        if outcome.is_stored() {
            debug!(
                key = request.key,
                ttl_secs = request.ttl.as_secs(),
                conjunctions = registrations.len(),
                "Cache entry stored"
            );
            Ok(outcome)
        } else {
            Ok(self.skipped(request.key, outcome))
        }
    }

    /// Fetches a value. Lock markers read as absent; stamped entries whose
    /// stamps moved on are misses and get deleted.
    pub fn read(&self, prefix: &str, key: &str, dnf: &Dnf) -> CacheResult<Option<Bytes>> {
        let value = self.config.degrade("get", self.store.get(key), || None)?;
        let Some(value) = value else {
            return Ok(None);
        };
        if value.starts_with(LOCK_MARKER) {
            return Ok(None);
        }
        if !self.config.stamped {
            return Ok(Some(value));
        }

        let Some(split) = value.iter().position(|byte| *byte == CHECKSUM_SEPARATOR) else {
            debug!(key, "Discarding unframed stamped entry");
            self.discard(key);
            return Ok(None);
        };
        let stored_checksum = String::from_utf8_lossy(&value[..split]);

        let conj_keys: Vec<String> = registrations(prefix, dnf)
            .into_iter()
            .map(|reg| reg.conj_key)
            .collect();
        let stamps = self.config.degrade(
            "mget",
            self.store.mget(&conj_keys).map(Some),
            || None,
        )?;
        let current = stamps.and_then(|stamps| {
            stamps
                .into_iter()
                .map(|stamp| stamp.map(|s| String::from_utf8_lossy(&s).into_owned()))
                .collect::<Option<Vec<_>>>()
        });

        match current {
            Some(stamps) if checksum(&stamps) == stored_checksum => {
                Ok(Some(value.slice(split + 1..)))
            }
            _ => {
                debug!(key, "Stamped entry is stale");
                self.discard(key);
                Ok(None)
            }
        }
    }

    /// Current checksum over the DNF's stamps, creating missing stamps.
    ///
    /// Take it before a long computation and pass it back as
    /// [`WriteRequest::expected_checksum`]. `None` when the store is
    /// unavailable and the degrade policy applies.
    pub fn snapshot_checksum(
        &self,
        prefix: &str,
        dnf: &Dnf,
        ttl: Duration,
    ) -> CacheResult<Option<String>> {
        let fresh = Uuid::new_v4().simple().to_string();
        let stamps = self.config.degrade(
            "ensure_stamps",
            self.store
                .ensure_stamps(&registrations(prefix, dnf), &fresh, self.config.conj_ttl(ttl))
                .map(Some),
            || None,
        )?;
        Ok(stamps.map(|stamps| checksum(&stamps)))
    }

    fn cache_entry(&self, write: &EntryWrite<'_>) -> CacheResult<Option<bool>> {
        self.config
            .degrade("cache_entry", self.store.cache_entry(write).map(Some), || None)
    }

    fn discard(&self, key: &str) {
        if let Err(err) = self.store.del(&[key.to_string()]) {
            warn!(key, error = %err, "Failed to discard stale cache entry");
        }
    }

    fn skipped(&self, key: &str, outcome: WriteOutcome) -> WriteOutcome {
        debug!(key, reason = outcome.reason(), "Cache write skipped");
        counter!("granule_cache_write_skipped_total", "reason" => outcome.reason()).increment(1);
        outcome
    }
}

/// Registrations of an entry under every conjunction of `dnf`, in DNF order.
pub fn registrations(prefix: &str, dnf: &Dnf) -> Vec<ConjRegistration> {
    dnf.conjunctions()
        .map(|(table, conjunction)| ConjRegistration {
            conj_key: conj::conj_key(prefix, table, conjunction),
            scheme_key: conj::scheme_key(prefix, table),
            scheme: conj::scheme(conjunction),
        })
        .collect()
}

/// SHA-256 hex over stamps in registration order.
pub fn checksum<S: AsRef<str>>(stamps: &[S]) -> String {
    let mut hasher = Sha256::new();
    for stamp in stamps {
        hasher.update(stamp.as_ref().as_bytes());
        hasher.update([CHECKSUM_SEPARATOR]);
    }
    hex::encode(hasher.finalize())
}
