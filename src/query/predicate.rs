//! Predicate trees as handed over by the data-access layer.
//!
//! The tree is independent of any query builder: the host translates its own
//! filter objects into [`Predicate`] nodes before asking for a DNF.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A changed row: field name to post-change value.
pub type Row = BTreeMap<String, Value>;

/// Scalar compared by an equality atom or carried in a changed row.
///
/// Rendering through [`fmt::Display`] is fixed and locale independent, so the
/// same logical value canonicalizes identically in every process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Str(value) => f.write_str(value),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Storage kind of a column, used to mark fields whose equality is not worth tracking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum FieldKind {
    #[default]
    Integer,
    Float,
    Boolean,
    Char,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    Other(String),
}

impl FieldKind {
    pub fn as_str(&self) -> &str {
        match self {
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::Char => "char",
            FieldKind::Text => "text",
            FieldKind::Binary => "binary",
            FieldKind::Json => "json",
            FieldKind::Uuid => "uuid",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Other(name) => name,
        }
    }
}

impl FromStr for FieldKind {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let kind = match value.trim().to_ascii_lowercase().as_str() {
            "integer" => FieldKind::Integer,
            "float" => FieldKind::Float,
            "boolean" => FieldKind::Boolean,
            "char" => FieldKind::Char,
            "text" => FieldKind::Text,
            "binary" => FieldKind::Binary,
            "json" => FieldKind::Json,
            "uuid" => FieldKind::Uuid,
            "timestamp" => FieldKind::Timestamp,
            other => FieldKind::Other(other.to_string()),
        };
        Ok(kind)
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    /// A subquery, column reference or computed expression. Never tracked.
    Expression,
}

impl<T: Into<Value>> From<T> for Operand {
    fn from(value: T) -> Self {
        Operand::Value(value.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Exact(Operand),
    /// `IS NULL` when true, `IS NOT NULL` when false.
    IsNull(bool),
    In(Vec<Operand>),
    /// Any other lookup (`<`, `LIKE`, ...), identified by name for logging only.
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub alias: String,
    pub field: String,
    pub kind: FieldKind,
    pub op: Op,
}

impl Leaf {
    pub fn new(alias: impl Into<String>, field: impl Into<String>, op: Op) -> Self {
        Self {
            alias: alias.into(),
            field: field.into(),
            kind: FieldKind::default(),
            op,
        }
    }

    pub fn exact(alias: impl Into<String>, field: impl Into<String>, value: impl Into<Operand>) -> Self {
        Self::new(alias, field, Op::Exact(value.into()))
    }

    pub fn is_null(alias: impl Into<String>, field: impl Into<String>, is_null: bool) -> Self {
        Self::new(alias, field, Op::IsNull(is_null))
    }

    pub fn one_of<I, V>(alias: impl Into<String>, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Operand>,
    {
        Self::new(
            alias,
            field,
            Op::In(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn other(alias: impl Into<String>, field: impl Into<String>, lookup: impl Into<String>) -> Self {
        Self::new(alias, field, Op::Other(lookup.into()))
    }

    pub fn with_kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Filter predicate. `And(vec![])` is the empty, always-true predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Leaf(Leaf),
}

impl Predicate {
    pub fn always() -> Self {
        Predicate::And(Vec::new())
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::always()
    }
}

impl From<Leaf> for Predicate {
    fn from(leaf: Leaf) -> Self {
        Predicate::Leaf(leaf)
    }
}

/// A table participating in a query under an alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub alias: String,
    pub table: String,
}

/// Everything the translator needs to know about one logical query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub tables: Vec<TableRef>,
    pub predicate: Predicate,
    /// Branches combined with `UNION`.
    pub unions: Vec<Query>,
    /// Subqueries backing computed columns.
    pub subqueries: Vec<Query>,
}

impl Query {
    /// A query over a single table aliased by its own name.
    pub fn table(table: impl Into<String>) -> Self {
        let table = table.into();
        Self::default().join(table.clone(), table)
    }

    pub fn join(mut self, alias: impl Into<String>, table: impl Into<String>) -> Self {
        self.tables.push(TableRef {
            alias: alias.into(),
            table: table.into(),
        });
        self
    }

    pub fn filter(mut self, predicate: impl Into<Predicate>) -> Self {
        self.predicate = predicate.into();
        self
    }

    pub fn union(mut self, other: Query) -> Self {
        self.unions.push(other);
        self
    }

    pub fn annotate(mut self, subquery: Query) -> Self {
        self.subqueries.push(subquery);
        self
    }

    /// Physical tables touched by this query, its unions and subqueries, deduplicated.
    pub fn touched_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        self.collect_tables(&mut tables);
        tables
    }

    fn collect_tables(&self, out: &mut Vec<String>) {
        for table_ref in &self.tables {
            if !out.contains(&table_ref.table) {
                out.push(table_ref.table.clone());
            }
        }
        for nested in self.unions.iter().chain(&self.subqueries) {
            nested.collect_tables(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_rendering_is_fixed() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Int(-42).to_string(), "-42");
        assert_eq!(Value::Float(1.5).to_string(), "1.5");
        assert_eq!(Value::Float(1e21).to_string(), "1000000000000000000000");
        assert_eq!(Value::from("x y").to_string(), "x y");
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn field_kind_parses_known_and_custom_names() {
        assert_eq!("Text".parse::<FieldKind>().unwrap(), FieldKind::Text);
        assert_eq!(
            "geometry".parse::<FieldKind>().unwrap(),
            FieldKind::Other("geometry".into())
        );
        assert_eq!(FieldKind::Other("geometry".into()).as_str(), "geometry");
    }

    #[test]
    fn touched_tables_include_unions_and_subqueries() {
        let query = Query::table("post")
            .join("a", "author")
            .union(Query::table("post"))
            .annotate(Query::table("comment"));

        assert_eq!(query.touched_tables(), vec!["post", "author", "comment"]);
    }

    #[test]
    fn rows_deserialize_from_json() {
        let row: Row = serde_json::from_str(r#"{"id": 5, "title": "x", "deleted": null}"#)
            .expect("row should deserialize");
        assert_eq!(row["id"], Value::Int(5));
        assert_eq!(row["title"], Value::from("x"));
        assert_eq!(row["deleted"], Value::Null);
    }
}
