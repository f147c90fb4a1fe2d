//! Stable configuration digests used as trial and instance identities.
//!
//! Assignments and model descriptors are written out in a canonical,
//! versioned text form (fields ordered by name, floats by bit pattern) and
//! hashed with SHA-256, so the same configuration maps to the same digest
//! across processes and formatting changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::{self, Write};

use crate::hyperparameters::{Assignment, ParameterValue};

/// Bump when the canonical encoding changes.
pub const CANONICAL_VERSION: u32 = 1;

/// Hex characters kept from the SHA-256 output (128 bits).
const DIGEST_HEX_LEN: usize = 32;

/// Configuration digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigDigest(String);

impl ConfigDigest {
    /// Digest of a fully resolved hyperparameter assignment.
    pub fn of_assignment(assignment: &Assignment) -> Self {
        Self::hash(&canonical_assignment(assignment))
    }

    /// Digest of a model descriptor (its canonical topology document).
    pub fn of_descriptor(descriptor: &Value) -> Self {
        let mut out = format!("hypertune-model/v{CANONICAL_VERSION}\n");
        write_canonical_json(&mut out, descriptor);
        Self::hash(&out)
    }

    fn hash(canonical: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let mut hex = format!("{:x}", hasher.finalize());
        hex.truncate(DIGEST_HEX_LEN);
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines. Shorter digests are returned whole.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a trial: the digest of its assignment.
pub fn compute_identity(assignment: &Assignment) -> ConfigDigest {
    ConfigDigest::of_assignment(assignment)
}

/// Canonical text form of an assignment. Each entry is
/// `<name-len>:<name>=<tag>:<value>` on its own line, in name order.
pub fn canonical_assignment(assignment: &Assignment) -> String {
    let mut out = format!("hypertune-config/v{CANONICAL_VERSION}\n");
    for (name, value) in assignment {
        let _ = write!(out, "{}:{}=", name.len(), name);
        match value {
            ParameterValue::Bool(v) => {
                let _ = write!(out, "b:{}", u8::from(*v));
            }
            ParameterValue::Int(v) => {
                let _ = write!(out, "i:{v}");
            }
            ParameterValue::Float(v) => {
                let _ = write!(out, "f:{:016x}", canonical_bits(*v));
            }
            ParameterValue::Text(v) => {
                let _ = write!(out, "s:{}:{}", v.len(), v);
            }
        }
        out.push('\n');
    }
    out
}

/// Bit pattern with `-0.0` folded into `0.0` and every NaN into one NaN.
fn canonical_bits(v: f64) -> u64 {
    if v == 0.0 {
        0.0f64.to_bits()
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

fn write_canonical_json(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "{i}");
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "{u}");
            } else {
                let _ = write!(out, "f{:016x}", canonical_bits(n.as_f64().unwrap_or(f64::NAN)));
            }
        }
        Value::String(s) => {
            let _ = write!(out, "{}:{}", s.len(), s);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:{}=", key.len(), key);
                write_canonical_json(out, &map[key]);
            }
            out.push('}');
        }
    }
}
