//! Granular, self-invalidating read-through cache for query results.
//!
//! Each cached result records the equality conditions it depends on. A changed
//! row deletes exactly the results whose conditions it satisfies; everything
//! else stays cached.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod query;
pub mod transaction;

pub(crate) mod util;

pub use cache::{CallRequest, CacheOp, CacheProfile, Engine, ReadRequest, no_invalidation};
pub use error::{CacheError, CacheResult};
pub use query::{Leaf, Predicate, Query, Row, Value};
