//! Granular read-through cache.
//!
//! - [`Coordinator`]: atomic write of an entry with its dependency registrations
//! - [`Dogpile`]: one recomputation per key at a time
//! - [`Invalidator`]: changed row to deleted entries
//! - [`Engine`]: the façade tying them to profiles, transactions and events
//!
//! ## Configuration
//!
//! Behaviour is controlled via the `[cache]` section of `granule.toml`:
//!
//! ```toml
//! [cache]
//! default_timeout_secs = 900
//! long_disjunction = 8
//!
//! [cache.profiles."blog.*"]
//! ops = ["get", "fetch"]
//! lock = true
//! ```

mod config;
mod coordinator;
mod dogpile;
mod engine;
mod events;
mod invalidator;
mod local;
mod profile;
mod reaper;

pub use config::CacheConfig;
pub use coordinator::{Coordinator, WriteOutcome, WriteRequest, checksum, registrations};
pub use dogpile::{Dogpile, LockOutcome, LockToken, signal_key};
pub use engine::{CallRequest, Engine, ReadRequest};
pub use events::{ALL_TABLES, Epoch, EventBus, InvalidationEvent};
pub use invalidator::{
    Invalidator, SuppressionGuard, conj_keys_for_row, is_suppressed, no_invalidation,
};
pub use local::LocalCache;
pub use profile::{CacheOp, CacheProfile, ProfileRegistry};
pub use reaper::{ReapReport, Reaper};
