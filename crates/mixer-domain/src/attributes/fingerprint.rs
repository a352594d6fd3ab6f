//! Order-independent fingerprinting of attribute sets.
//!
//! The fingerprint is the first 128 bits of a SHA-256 digest over a
//! canonical, length-prefixed encoding of the sorted `(name, value)` pairs.
//! Every value is tagged with its variant so `Int64(1)` and `Double(1.0)`
//! never collide by construction.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use super::{AttributeValue, Attributes};

const DOMAIN_TAG: &[u8] = b"mixer.attributes.v1";

const TAG_STRING: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_TIMESTAMP: u8 = 5;
const TAG_BYTES: u8 = 6;

/// Fixed-width cache key derived from an attribute set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Reserved fingerprint of the empty attribute set.
    pub const EMPTY: Fingerprint = Fingerprint([0; 16]);

    /// Computes the fingerprint of `attributes`.
    pub fn of(attributes: &Attributes) -> Self {
        if attributes.is_empty() {
            return Self::EMPTY;
        }

        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_TAG);
        for (name, value) in attributes {
            write_len_prefixed(&mut hasher, name.as_bytes());
            write_value(&mut hasher, value);
        }
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        // The all-zero value belongs to the empty set only.
        if bytes == Self::EMPTY.0 {
            bytes[15] = 1;
        }
        Self(bytes)
    }

    /// Builds a fingerprint from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns true for the reserved empty-set fingerprint.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Bit pattern of a double with `-0.0` folded into `0.0` and every NaN
/// folded into the canonical quiet NaN.
pub(super) fn double_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0_f64.to_bits()
    } else if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

/// Signed nanoseconds relative to the Unix epoch.
fn timestamp_nanos(value: SystemTime) -> i128 {
    match value.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i128,
        Err(before) => -(before.duration().as_nanos() as i128),
    }
}

fn write_len_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn write_value(hasher: &mut Sha256, value: &AttributeValue) {
    match value {
        AttributeValue::String(v) => {
            hasher.update([TAG_STRING]);
            write_len_prefixed(hasher, v.as_bytes());
        }
        AttributeValue::Int64(v) => {
            hasher.update([TAG_INT64]);
            hasher.update(v.to_le_bytes());
        }
        AttributeValue::Double(v) => {
            hasher.update([TAG_DOUBLE]);
            hasher.update(double_bits(*v).to_le_bytes());
        }
        AttributeValue::Bool(v) => {
            hasher.update([TAG_BOOL, u8::from(*v)]);
        }
        AttributeValue::Timestamp(v) => {
            hasher.update([TAG_TIMESTAMP]);
            hasher.update(timestamp_nanos(*v).to_le_bytes());
        }
        AttributeValue::Bytes(v) => {
            hasher.update([TAG_BYTES]);
            write_len_prefixed(hasher, v);
        }
    }
}
