//! Query-side logic: predicate model, DNF translation, key derivation, prefixes.
//!
//! Everything in here is pure and store independent.

pub mod conj;
pub mod dnf;
pub mod predicate;
pub mod prefix;

pub use dnf::{Atom, AtomValue, Conjunction, Dnf, TranslateOptions, translate};
pub use predicate::{FieldKind, Leaf, Op, Operand, Predicate, Query, Row, TableRef, Value};
pub use prefix::{PrefixContext, PrefixPolicy};
