//! Metadata filter evaluator.
//!
//! A filter is a conjunction of per-field predicates over schemaless scalar
//! metadata. A chunk matches when every clause holds against its own
//! metadata map, falling back to the parent document's map (chunk keys
//! shadow document keys). A missing field fails the clause unless the
//! predicate opts in with `allow_null`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Schemaless scalar metadata value. Deserialization order matters: `Int`
/// before `Float` so that JSON `3` stays integral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

pub type Metadata = BTreeMap<String, MetaValue>;

impl MetaValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Int(i) => Some(*i as f64),
            MetaValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Equality with Int/Float unified into one numeric domain.
    fn equals(&self, other: &MetaValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    /// Ordering for range bounds. Numbers compare numerically, strings
    /// lexicographically; booleans and mixed kinds do not order.
    fn compare(&self, other: &MetaValue) -> Option<Ordering> {
        match (self, other) {
            (MetaValue::Str(a), MetaValue::Str(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

/// One predicate clause. Wire form distinguishes the variants by their
/// required key: `{"eq": v}`, `{"in": [v...]}`, `{"gte": lo, "lte": hi}`.
/// Bounds on a range are inclusive and each side is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    Eq {
        eq: MetaValue,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        allow_null: bool,
    },
    In {
        r#in: Vec<MetaValue>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        allow_null: bool,
    },
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<MetaValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lte: Option<MetaValue>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        allow_null: bool,
    },
}

impl Predicate {
    fn allow_null(&self) -> bool {
        match self {
            Predicate::Eq { allow_null, .. }
            | Predicate::In { allow_null, .. }
            | Predicate::Range { allow_null, .. } => *allow_null,
        }
    }

    fn matches_value(&self, value: &MetaValue) -> bool {
        match self {
            Predicate::Eq { eq, .. } => value.equals(eq),
            Predicate::In { r#in, .. } => r#in.iter().any(|v| value.equals(v)),
            Predicate::Range { gte, lte, .. } => {
                if let Some(lo) = gte {
                    match value.compare(lo) {
                        Some(Ordering::Greater) | Some(Ordering::Equal) => {}
                        _ => return false,
                    }
                }
                if let Some(hi) = lte {
                    match value.compare(hi) {
                        Some(Ordering::Less) | Some(Ordering::Equal) => {}
                        _ => return false,
                    }
                }
                true
            }
        }
    }
}

/// A conjunction of field → predicate clauses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter {
    pub clauses: BTreeMap<String, Predicate>,
}

impl Filter {
    /// Reject malformed filter forms up front so evaluation stays total:
    /// a range needs at least one bound, and boolean bounds do not order.
    pub fn validate(&self) -> Result<()> {
        for (field, pred) in &self.clauses {
            if let Predicate::Range { gte, lte, .. } = pred {
                if gte.is_none() && lte.is_none() {
                    return Err(Error::Invalid(format!(
                        "range predicate on '{field}' needs at least one bound"
                    )));
                }
                for bound in [gte, lte].into_iter().flatten() {
                    if matches!(bound, MetaValue::Bool(_)) {
                        return Err(Error::Invalid(format!(
                            "range predicate on '{field}' cannot bound a boolean"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Evaluate against a chunk's metadata with the parent document's map as
    /// fallback.
    pub fn matches(&self, chunk_meta: &Metadata, doc_meta: Option<&Metadata>) -> bool {
        self.clauses.iter().all(|(field, pred)| {
            let value = chunk_meta
                .get(field)
                .or_else(|| doc_meta.and_then(|m| m.get(field)));
            match value {
                Some(v) => pred.matches_value(v),
                None => pred.allow_null(),
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}
