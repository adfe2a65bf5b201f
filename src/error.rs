use thiserror::Error;

use crate::infra::store::StoreError;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("cache store unavailable during `{op}`: {message}")]
    StoreUnavailable { op: &'static str, message: String },
    #[error("cache store rejected `{op}`: {message}")]
    Store { op: &'static str, message: String },
    #[error("malformed predicate tree: {message}")]
    Translation { message: String },
    #[error("failed to serialize cached value: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation {
            message: message.into(),
        }
    }

    pub fn store(op: &'static str, error: StoreError) -> Self {
        match error {
            StoreError::Unavailable(message) => Self::StoreUnavailable { op, message },
            StoreError::WrongType { key } => Self::Store {
                op,
                message: format!("key `{key}` holds a value of the wrong type"),
            },
            StoreError::Protocol(message) => Self::Store { op, message },
        }
    }

    /// Store connectivity problems are the only failures the degrade policy may swallow.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_taxonomy() {
        let err = CacheError::store("get", StoreError::Unavailable("connection refused".into()));
        assert!(err.is_unavailable());
        assert_eq!(
            err.to_string(),
            "cache store unavailable during `get`: connection refused"
        );

        let err = CacheError::store(
            "smembers",
            StoreError::WrongType {
                key: "conj:t:".into(),
            },
        );
        assert!(!err.is_unavailable());
        assert!(err.to_string().contains("wrong type"));
    }
}
