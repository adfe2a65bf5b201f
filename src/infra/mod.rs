//! Infrastructure adapters and runtime bootstrap.

pub mod store;
pub mod telemetry;
