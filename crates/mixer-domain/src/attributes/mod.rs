//! Typed request attributes.
//!
//! An [`Attributes`] set maps unique names to typed [`AttributeValue`]s.
//! Entries are kept sorted by name, so two sets with the same mapping
//! iterate, compare and fingerprint identically no matter how they were
//! built.

mod attributes_proptest;
mod fingerprint;

pub use fingerprint::Fingerprint;

use std::collections::btree_map::{self, BTreeMap};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Name of the string attribute selecting the quota for a Quota call.
pub const QUOTA_NAME: &str = "quota.name";

/// Name of the int64 attribute carrying the requested quota amount.
pub const QUOTA_AMOUNT: &str = "quota.amount";

/// A single typed attribute value.
///
/// Exactly one variant is active. Typed accessors return `None` for any
/// other variant instead of reinterpreting the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    String(String),
    Int64(i64),
    Double(f64),
    Bool(bool),
    Timestamp(SystemTime),
    Bytes(Vec<u8>),
}

impl AttributeValue {
    /// Returns the name of the active variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::String(_) => "string",
            AttributeValue::Int64(_) => "int64",
            AttributeValue::Double(_) => "double",
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Timestamp(_) => "timestamp",
            AttributeValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<SystemTime> {
        match self {
            AttributeValue::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttributeValue::Bytes(value) => Some(value),
            _ => None,
        }
    }

    /// Value equality as seen by the fingerprint.
    ///
    /// Doubles compare by normalized bit pattern, so `NaN` equals itself and
    /// `-0.0` equals `0.0`.
    pub fn same_as(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (AttributeValue::Double(a), AttributeValue::Double(b)) => {
                fingerprint::double_bits(*a) == fingerprint::double_bits(*b)
            }
            _ => self == other,
        }
    }

    /// Approximate in-memory size used for report buffer accounting.
    pub fn estimated_size(&self) -> usize {
        match self {
            AttributeValue::String(value) => value.len(),
            AttributeValue::Bytes(value) => value.len(),
            AttributeValue::Int64(_) | AttributeValue::Double(_) => 8,
            AttributeValue::Bool(_) => 1,
            AttributeValue::Timestamp(_) => 12,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int64(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<SystemTime> for AttributeValue {
    fn from(value: SystemTime) -> Self {
        AttributeValue::Timestamp(value)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        AttributeValue::Bytes(value)
    }
}

/// A set of named attributes describing one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    entries: BTreeMap<String, AttributeValue>,
}

impl Attributes {
    /// Creates an empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts or replaces an attribute, returning the previous value.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Option<AttributeValue> {
        self.entries.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in ascending name order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, AttributeValue> {
        self.entries.iter()
    }

    /// Returns the order-independent fingerprint of this set.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }

    /// Returns the entries of `current` that are absent from `base` or carry
    /// a different value there.
    pub fn diff(base: &Attributes, current: &Attributes) -> Attributes {
        current
            .iter()
            .filter(|(name, value)| !base.get(name).is_some_and(|old| old.same_as(value)))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Computes the full delta of this set against `base`, including names
    /// that were dropped.
    pub fn delta_from(&self, base: &Attributes) -> AttributeUpdate {
        let removed = base
            .entries
            .keys()
            .filter(|name| !self.entries.contains_key(*name))
            .cloned()
            .collect();
        AttributeUpdate {
            changed: Attributes::diff(base, self),
            removed,
        }
    }

    /// Approximate memory held by this set.
    pub fn estimated_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(name, value)| name.len() + value.estimated_size())
            .sum()
    }
}

impl<K, V> FromIterator<(K, V)> for Attributes
where
    K: Into<String>,
    V: Into<AttributeValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = (&'a String, &'a AttributeValue);
    type IntoIter = btree_map::Iter<'a, String, AttributeValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Delta of an attribute set relative to a baseline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    /// Entries added or changed since the baseline.
    pub changed: Attributes,
    /// Names present in the baseline but missing now.
    pub removed: Vec<String>,
}

impl AttributeUpdate {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Per-channel baseline used to send minimal attribute updates.
///
/// Each call to [`AttributeContext::next_update`] returns the delta against
/// the previous call on the same channel and advances the baseline, so the
/// request index and the delta always move together.
#[derive(Debug, Default)]
pub struct AttributeContext {
    baseline: Attributes,
    next_index: u64,
}

impl AttributeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(request_index, delta)` for `current` and makes it the new baseline.
    pub fn next_update(&mut self, current: &Attributes) -> (u64, AttributeUpdate) {
        let index = self.next_index;
        self.next_index += 1;
        let update = current.delta_from(&self.baseline);
        self.baseline = current.clone();
        (index, update)
    }

    /// Forgets the baseline, e.g. after the underlying stream was re-established.
    pub fn reset(&mut self) {
        self.baseline = Attributes::new();
    }
}
