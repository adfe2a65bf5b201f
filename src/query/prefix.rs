//! Shard-routing prefixes.
//!
//! Every key written for one logical query (entry, conjunction sets, schemes,
//! lock signal) starts with the same prefix, so a hash-tagged prefix keeps them
//! on one store node and the atomic write/invalidate steps stay single-node.

use std::fmt;
use std::sync::Arc;

use crate::error::{CacheError, CacheResult};

/// Dimensions a prefix may be derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixContext {
    pub tables: Vec<String>,
    pub dbs: Vec<String>,
    /// Identity of a cached function, for caches that are not a single query.
    pub function: Option<String>,
}

impl PrefixContext {
    pub fn for_query(tables: Vec<String>, db: impl Into<String>) -> Self {
        Self {
            tables,
            dbs: vec![db.into()],
            function: None,
        }
    }

    pub fn for_function(name: impl Into<String>) -> Self {
        Self {
            function: Some(name.into()),
            ..Self::default()
        }
    }
}

type PrefixFn = dyn Fn(&PrefixContext) -> CacheResult<String> + Send + Sync;

/// How the prefix of a cache operation is derived.
#[derive(Clone, Default)]
pub enum PrefixPolicy {
    #[default]
    None,
    Fixed(String),
    /// One prefix per database alias; a query must touch exactly one.
    PerDatabase { hash_tag: bool },
    /// One prefix per physical table; a query must touch exactly one.
    PerTable { hash_tag: bool },
    Custom(Arc<PrefixFn>),
}

impl fmt::Debug for PrefixPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixPolicy::None => f.write_str("None"),
            PrefixPolicy::Fixed(prefix) => f.debug_tuple("Fixed").field(prefix).finish(),
            PrefixPolicy::PerDatabase { hash_tag } => f
                .debug_struct("PerDatabase")
                .field("hash_tag", hash_tag)
                .finish(),
            PrefixPolicy::PerTable { hash_tag } => f
                .debug_struct("PerTable")
                .field("hash_tag", hash_tag)
                .finish(),
            PrefixPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PrefixPolicy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&PrefixContext) -> CacheResult<String> + Send + Sync + 'static,
    {
        PrefixPolicy::Custom(Arc::new(f))
    }

    /// Resolves the prefix for `ctx`. Ambiguous dimensions are configuration errors,
    /// since invalidation needs exactly one prefix per logical shard.
    pub fn resolve(&self, ctx: &PrefixContext) -> CacheResult<String> {
        match self {
            PrefixPolicy::None => Ok(String::new()),
            PrefixPolicy::Fixed(prefix) => {
                check_tags(prefix)?;
                Ok(prefix.clone())
            }
            PrefixPolicy::PerDatabase { hash_tag } => {
                let db = single("database", &ctx.dbs)?;
                render(db, *hash_tag)
            }
            PrefixPolicy::PerTable { hash_tag } => {
                let candidates: Vec<String> = match &ctx.function {
                    Some(function) if ctx.tables.is_empty() => vec![function.clone()],
                    _ => ctx.tables.clone(),
                };
                let table = single("table", &candidates)?;
                render(table, *hash_tag)
            }
            PrefixPolicy::Custom(f) => {
                let prefix = f(ctx)?;
                check_tags(&prefix)?;
                Ok(prefix)
            }
        }
    }
}

fn single<'a>(dimension: &str, values: &'a [String]) -> CacheResult<&'a str> {
    let mut distinct = values.iter().map(String::as_str).collect::<Vec<_>>();
    distinct.sort_unstable();
    distinct.dedup();
    match distinct.as_slice() {
        [one] => Ok(*one),
        [] => Err(CacheError::configuration(format!(
            "prefix requires a {dimension} but none was supplied"
        ))),
        many => Err(CacheError::configuration(format!(
            "prefix requires a single {dimension}, got {}",
            many.join(", ")
        ))),
    }
}

fn render(value: &str, hash_tag: bool) -> CacheResult<String> {
    if hash_tag {
        if value.contains(['{', '}']) {
            return Err(CacheError::configuration(format!(
                "prefix value `{value}` would nest hash-tag delimiters"
            )));
        }
        Ok(format!("{{{value}}}:"))
    } else {
        Ok(format!("{value}:"))
    }
}

/// A prefix may contain at most one well-formed `{...}` hash tag.
fn check_tags(prefix: &str) -> CacheResult<()> {
    let opens = prefix.matches('{').count();
    let closes = prefix.matches('}').count();
    let well_formed = match (prefix.find('{'), prefix.find('}')) {
        (Some(open), Some(close)) => open < close,
        (None, None) => true,
        _ => false,
    };
    if opens > 1 || closes > 1 || opens != closes || !well_formed {
        return Err(CacheError::configuration(format!(
            "prefix `{prefix}` contains nested or unbalanced hash-tag delimiters"
        )));
    }
    Ok(())
}
