//! The core primitive: an immutable, content-addressed [`Fact`].
//!
//! A fact's identity is the hash of its own contents — its type, its named
//! **predecessor** references to other facts, and its scalar fields. Facts
//! are never mutated after creation; they form a directed acyclic graph in
//! which edges (predecessor references) point backward in time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scalar field value.
///
/// Finite only — `NaN` is rejected at [`Fact::new`] time, since `NaN != NaN`
/// would violate the "same fields ⇒ same hash" contract that [`Fact`]
/// identity depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Scalar {
    /// A text string.
    String(String),
    /// A finite double.
    Number(f64),
    /// A boolean.
    Boolean(bool),
    /// An ISO-8601 timestamp.
    Timestamp(DateTime<Utc>),
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}
impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}
impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}
impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Boolean(b)
    }
}
impl From<DateTime<Utc>> for Scalar {
    fn from(t: DateTime<Utc>) -> Self {
        Scalar::Timestamp(t)
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::String(s) => write!(f, "{s}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Boolean(b) => write!(f, "{b}"),
            Scalar::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

/// A typed reference to a fact: `(type, hash)`. Equality is structural and
/// does not require the referenced fact to be present locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub fact_type: String,
    pub hash: String,
}

impl Reference {
    pub fn new(fact_type: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            fact_type: fact_type.into(),
            hash: hash.into(),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.fact_type, self.hash)
    }
}

impl From<&Fact> for Reference {
    fn from(fact: &Fact) -> Self {
        Reference::new(fact.fact_type.clone(), fact.hash.clone())
    }
}

/// The value of a predecessor role: either a single reference or an
/// ordered list of references. Order is preserved as given — it is never
/// sorted, since it is caller-meaningful (spec §4.A).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredecessorValue {
    Single(Reference),
    Many(Vec<Reference>),
}

impl PredecessorValue {
    /// All references in this predecessor value, in order.
    pub fn references(&self) -> Vec<&Reference> {
        match self {
            PredecessorValue::Single(r) => vec![r],
            PredecessorValue::Many(rs) => rs.iter().collect(),
        }
    }

    /// The single reference, if this predecessor value is not a list.
    pub fn as_single(&self) -> Option<&Reference> {
        match self {
            PredecessorValue::Single(r) => Some(r),
            PredecessorValue::Many(_) => None,
        }
    }
}

/// An immutable fact: `{ type, hash, predecessors, fields }`.
///
/// `hash` is a deterministic digest of `(fact_type, predecessors, fields)`
/// computed by [`Fact::new`] — it is a total, pure function of those three
/// fields, insensitive to map key insertion order (predecessors and fields
/// are stored in [`BTreeMap`]s, which always iterate in sorted key order).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub fact_type: String,
    pub hash: String,
    pub predecessors: BTreeMap<String, PredecessorValue>,
    pub fields: BTreeMap<String, Scalar>,
}

/// Rejected at construction: a `Scalar::Number` field was `NaN`, which would
/// break the hash's "same fields imply same hash" contract.
#[derive(Debug, Clone, thiserror::Error)]
#[error("field `{0}` is NaN, which cannot be hashed deterministically")]
pub struct NotANumber(pub String);

impl Fact {
    /// Construct a new fact, computing its content hash.
    ///
    /// Returns an error if any numeric field is `NaN`.
    pub fn new(
        fact_type: impl Into<String>,
        predecessors: BTreeMap<String, PredecessorValue>,
        fields: BTreeMap<String, Scalar>,
    ) -> Result<Self, NotANumber> {
        for (name, value) in &fields {
            if let Scalar::Number(n) = value {
                if n.is_nan() {
                    return Err(NotANumber(name.clone()));
                }
            }
        }
        let fact_type = fact_type.into();
        let hash = hash_fact(&fact_type, &predecessors, &fields);
        Ok(Self {
            fact_type,
            hash,
            predecessors,
            fields,
        })
    }

    pub fn reference(&self) -> Reference {
        Reference::from(self)
    }
}

/// Canonical, platform-independent digest of `(type, predecessors, fields)`.
///
/// `BTreeMap` iteration is already key-sorted, so insertion order never
/// affects the digest. Scalars are encoded with a fixed, tag-prefixed byte
/// form — no locale-dependent number formatting — satisfying the hashing
/// contract of spec §4.A.
fn hash_fact(
    fact_type: &str,
    predecessors: &BTreeMap<String, PredecessorValue>,
    fields: &BTreeMap<String, Scalar>,
) -> String {
    let mut hasher = blake3::Hasher::new();
    write_str(&mut hasher, fact_type);

    hasher.update(&(predecessors.len() as u64).to_be_bytes());
    for (role, value) in predecessors {
        write_str(&mut hasher, role);
        match value {
            PredecessorValue::Single(r) => {
                hasher.update(&[0u8]);
                write_reference(&mut hasher, r);
            }
            PredecessorValue::Many(rs) => {
                hasher.update(&[1u8]);
                hasher.update(&(rs.len() as u64).to_be_bytes());
                for r in rs {
                    write_reference(&mut hasher, r);
                }
            }
        }
    }

    hasher.update(&(fields.len() as u64).to_be_bytes());
    for (name, value) in fields {
        write_str(&mut hasher, name);
        write_scalar(&mut hasher, value);
    }

    hasher.finalize().to_hex().to_string()
}

fn write_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn write_reference(hasher: &mut blake3::Hasher, r: &Reference) {
    write_str(hasher, &r.fact_type);
    write_str(hasher, &r.hash);
}

fn write_scalar(hasher: &mut blake3::Hasher, value: &Scalar) {
    match value {
        Scalar::String(s) => {
            hasher.update(&[0u8]);
            write_str(hasher, s);
        }
        Scalar::Number(n) => {
            hasher.update(&[1u8]);
            hasher.update(&n.to_bits().to_be_bytes());
        }
        Scalar::Boolean(b) => {
            hasher.update(&[2u8]);
            hasher.update(&[*b as u8]);
        }
        Scalar::Timestamp(t) => {
            hasher.update(&[3u8]);
            write_str(hasher, &t.to_rfc3339());
        }
    }
}

/// A fact plus the opaque signatures attached to it.
///
/// The core does not interpret signatures — it persists and forwards them
/// unchanged (spec §3 Fact envelope) and never hashes them (spec §9, Open
/// Question 3: signatures do not participate in identity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactEnvelope {
    pub fact: Fact,
    pub signatures: Vec<Vec<u8>>,
}

impl FactEnvelope {
    pub fn new(fact: Fact) -> Self {
        Self {
            fact,
            signatures: Vec::new(),
        }
    }

    pub fn with_signatures(fact: Fact, signatures: Vec<Vec<u8>>) -> Self {
        Self { fact, signatures }
    }

    pub fn reference(&self) -> Reference {
        self.fact.reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred(fact_type: &str, hash: &str) -> PredecessorValue {
        PredecessorValue::Single(Reference::new(fact_type, hash))
    }

    #[test]
    fn identical_content_hashes_identically() {
        let mut fields_a = BTreeMap::new();
        fields_a.insert("identifier".to_string(), Scalar::from("TestCo"));
        let mut fields_b = BTreeMap::new();
        fields_b.insert("identifier".to_string(), Scalar::from("TestCo"));

        let mut preds_a = BTreeMap::new();
        preds_a.insert("creator".to_string(), pred("User", "abc"));
        let mut preds_b = BTreeMap::new();
        preds_b.insert("creator".to_string(), pred("User", "abc"));

        let a = Fact::new("Company", preds_a, fields_a).unwrap();
        let b = Fact::new("Company", preds_b, fields_b).unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn different_fields_hash_differently() {
        let mut fields_a = BTreeMap::new();
        fields_a.insert("identifier".to_string(), Scalar::from("TestCo"));
        let mut fields_b = BTreeMap::new();
        fields_b.insert("identifier".to_string(), Scalar::from("OtherCo"));

        let a = Fact::new("Company", BTreeMap::new(), fields_a).unwrap();
        let b = Fact::new("Company", BTreeMap::new(), fields_b).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn predecessor_order_in_many_affects_hash() {
        let preds_a = {
            let mut m = BTreeMap::new();
            m.insert(
                "members".to_string(),
                PredecessorValue::Many(vec![
                    Reference::new("User", "a"),
                    Reference::new("User", "b"),
                ]),
            );
            m
        };
        let preds_b = {
            let mut m = BTreeMap::new();
            m.insert(
                "members".to_string(),
                PredecessorValue::Many(vec![
                    Reference::new("User", "b"),
                    Reference::new("User", "a"),
                ]),
            );
            m
        };
        let a = Fact::new("Team", preds_a, BTreeMap::new()).unwrap();
        let b = Fact::new("Team", preds_b, BTreeMap::new()).unwrap();
        assert_ne!(a.hash, b.hash, "predecessor list order is significant");
    }

    #[test]
    fn nan_field_is_rejected() {
        let mut fields = BTreeMap::new();
        fields.insert("score".to_string(), Scalar::Number(f64::NAN));
        let err = Fact::new("Measurement", BTreeMap::new(), fields).unwrap_err();
        assert_eq!(err.0, "score");
    }
}
