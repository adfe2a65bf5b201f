//! Predicate tree to disjunctive normal form of equality atoms.
//!
//! The transform over-approximates: every row matching the predicate fully
//! satisfies at least one produced conjunction. Anything the translator cannot
//! express as an equality degrades to an unknown atom, which in turn widens the
//! table's DNF, never narrows it.

use std::collections::{BTreeMap, HashSet};

use crate::config::DEFAULT_LONG_DISJUNCTION;
use crate::error::{CacheError, CacheResult};

use super::predicate::{FieldKind, Leaf, Op, Operand, Predicate, Query, Value};

/// Right-hand side of an atom; `Unknown` marks a condition that is not tracked.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomValue {
    Known(Value),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub alias: String,
    pub field: String,
    pub value: AtomValue,
    pub negated: bool,
}

impl Atom {
    fn known(leaf: &Leaf, value: Value, negated: bool) -> Self {
        Self {
            alias: leaf.alias.clone(),
            field: leaf.field.clone(),
            value: AtomValue::Known(value),
            negated,
        }
    }

    fn unknown(leaf: &Leaf) -> Self {
        Self {
            alias: leaf.alias.clone(),
            field: leaf.field.clone(),
            value: AtomValue::Unknown,
            negated: false,
        }
    }

    fn flipped(&self) -> Self {
        Self {
            negated: !self.negated,
            ..self.clone()
        }
    }
}

/// AND of `field = value` tests over one table. Empty means "always matches".
pub type Conjunction = BTreeMap<String, Value>;

/// Per-table OR of conjunctions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dnf {
    tables: BTreeMap<String, Vec<Conjunction>>,
}

impl Dnf {
    pub fn new() -> Self {
        Self::default()
    }

    /// A DNF that invalidates on any change to each of `tables`.
    pub fn always<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut dnf = Self::new();
        for table in tables {
            dnf.extend_table(table.into(), vec![Conjunction::new()]);
        }
        dnf
    }

    pub fn get(&self, table: &str) -> Option<&[Conjunction]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Conjunction])> {
        self.tables
            .iter()
            .map(|(table, conjs)| (table.as_str(), conjs.as_slice()))
    }

    /// Every `(table, conjunction)` pair, in table then list order.
    pub fn conjunctions(&self) -> impl Iterator<Item = (&str, &Conjunction)> {
        self.iter()
            .flat_map(|(table, conjs)| conjs.iter().map(move |conj| (table, conj)))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn is_always(&self, table: &str) -> bool {
        self.get(table)
            .is_some_and(|conjs| conjs.iter().any(Conjunction::is_empty))
    }

    /// Adds conjunctions to a table, keeping the list de-duplicated and
    /// collapsing it to `[{}]` once any member is unconditional.
    pub fn extend_table(&mut self, table: impl Into<String>, conjs: Vec<Conjunction>) {
        let entry = self.tables.entry(table.into()).or_default();
        if entry.len() == 1 && entry[0].is_empty() {
            return;
        }
        for conj in conjs {
            if conj.is_empty() {
                entry.clear();
                entry.push(Conjunction::new());
                return;
            }
            if !entry.contains(&conj) {
                entry.push(conj);
            }
        }
    }

    pub fn merge(&mut self, other: Dnf) {
        for (table, conjs) in other.tables {
            self.extend_table(table, conjs);
        }
    }
}

/// Knobs the translator reads from the cache configuration.
#[derive(Debug, Clone)]
pub struct TranslateOptions {
    /// `IN` lists longer than this are not expanded.
    pub long_disjunction: usize,
    pub untrackable: HashSet<FieldKind>,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            long_disjunction: DEFAULT_LONG_DISJUNCTION,
            untrackable: HashSet::from([FieldKind::Text, FieldKind::Binary]),
        }
    }
}

/// Translates a query, its unions and its subqueries into a per-table DNF.
///
/// Unsupported predicate shapes never fail; they widen the affected table to
/// `[{}]`. Only a leaf naming an undeclared alias or an empty field is an error.
pub fn translate(query: &Query, options: &TranslateOptions) -> CacheResult<Dnf> {
    let aliases: HashSet<&str> = query.tables.iter().map(|t| t.alias.as_str()).collect();
    let raw = raw_dnf(&query.predicate, false, &aliases, options)?;

    let mut dnf = Dnf::new();
    for table_ref in &query.tables {
        dnf.extend_table(table_ref.table.clone(), finalize(&raw, &table_ref.alias));
    }

    for nested in query.unions.iter().chain(&query.subqueries) {
        dnf.merge(translate(nested, options)?);
    }

    Ok(dnf)
}

type RawDnf = Vec<Vec<Atom>>;

fn raw_dnf(
    predicate: &Predicate,
    negated: bool,
    aliases: &HashSet<&str>,
    options: &TranslateOptions,
) -> CacheResult<RawDnf> {
    match predicate {
        Predicate::Leaf(leaf) => {
            let dnf = leaf_dnf(leaf, aliases, options)?;
            Ok(if negated { negate(dnf) } else { dnf })
        }
        Predicate::Not(inner) => raw_dnf(inner, !negated, aliases, options),
        Predicate::And(children) | Predicate::Or(children) => {
            let children = children
                .iter()
                .map(|child| raw_dnf(child, negated, aliases, options))
                .collect::<CacheResult<Vec<_>>>()?;
            // De Morgan: a negated AND combines its negated children as an OR.
            let conjunctive = matches!(predicate, Predicate::And(_)) != negated;
            Ok(if conjunctive {
                product(children)
            } else {
                children.into_iter().flatten().collect()
            })
        }
    }
}

fn leaf_dnf(leaf: &Leaf, aliases: &HashSet<&str>, options: &TranslateOptions) -> CacheResult<RawDnf> {
    if leaf.field.is_empty() {
        return Err(CacheError::translation(format!(
            "leaf on alias `{}` has an empty field name",
            leaf.alias
        )));
    }
    if !aliases.contains(leaf.alias.as_str()) {
        return Err(CacheError::translation(format!(
            "leaf `{}.{}` references an undeclared alias",
            leaf.alias, leaf.field
        )));
    }

    let unknown = || vec![vec![Atom::unknown(leaf)]];
    if options.untrackable.contains(&leaf.kind) {
        return Ok(unknown());
    }

    let dnf = match &leaf.op {
        Op::Exact(Operand::Value(value)) => vec![vec![Atom::known(leaf, value.clone(), false)]],
        Op::IsNull(is_null) => vec![vec![Atom::known(leaf, Value::Null, !is_null)]],
        Op::In(operands) if operands.len() <= options.long_disjunction => {
            let mut dnf = Vec::with_capacity(operands.len());
            for operand in operands {
                match operand {
                    Operand::Value(value) => {
                        dnf.push(vec![Atom::known(leaf, value.clone(), false)]);
                    }
                    Operand::Expression => return Ok(unknown()),
                }
            }
            dnf
        }
        Op::Exact(Operand::Expression) | Op::In(_) | Op::Other(_) => unknown(),
    };
    Ok(dnf)
}

/// NOT (OR_i AND_j a_ij) = AND_i (OR_j NOT a_ij), expanded back into DNF.
fn negate(dnf: RawDnf) -> RawDnf {
    product(
        dnf.into_iter()
            .map(|conj| conj.iter().map(|atom| vec![atom.flipped()]).collect())
            .collect(),
    )
}

fn product(factors: Vec<RawDnf>) -> RawDnf {
    let mut acc: RawDnf = vec![Vec::new()];
    for factor in factors {
        let mut next = Vec::with_capacity(acc.len() * factor.len());
        for left in &acc {
            for right in &factor {
                let mut conj = left.clone();
                conj.extend(right.iter().cloned());
                next.push(conj);
            }
        }
        acc = next;
        if acc.is_empty() {
            break;
        }
    }
    acc
}

/// Reduces the raw DNF to the conjunctions one alias contributes.
fn finalize(raw: &RawDnf, alias: &str) -> Vec<Conjunction> {
    let mut out: Vec<Conjunction> = Vec::new();

    'conj: for atoms in raw {
        let mut conj = Conjunction::new();
        for atom in atoms {
            if atom.alias != alias || atom.negated {
                continue;
            }
            let AtomValue::Known(value) = &atom.value else {
                continue;
            };
            // Conflicts are decided on the rendered value, the same text the
            // conjunction key carries, so `1` and `1.0` agree.
            match conj.get(&atom.field) {
                Some(existing) if existing.to_string() != value.to_string() => continue 'conj,
                Some(_) => {}
                None => {
                    conj.insert(atom.field.clone(), value.clone());
                }
            }
        }

        // The table's precision is bounded by its least precise member.
        if conj.is_empty() {
            return vec![Conjunction::new()];
        }
        if !out.contains(&conj) {
            out.push(conj);
        }
    }

    out
}
