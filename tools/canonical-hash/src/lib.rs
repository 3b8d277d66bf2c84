/*!
Stable content fingerprints.

Every entity in the system that needs a durable identity (packages, jobs,
instance groups, the shared packages layer) is reduced to a canonical byte
stream and hashed with SHA-1. The encoding is designed so that the same
logical inputs produce the same digest on any host: every token carries a
type tag and a length prefix, mappings are emitted with their keys in
lexicographic order, and nil is a distinct token from the empty string.
*/

use serde_json::Value;
use sha1::{Digest, Sha1};
use snafu::{OptionExt, Snafu};
use std::collections::BTreeMap;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Value cannot be canonically encoded: {}", reason))]
    Encoding { reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

// Type tags for the canonical byte stream. Changing any of these changes
// every fingerprint in existence.
const TAG_NIL: u8 = b'z';
const TAG_BOOL: u8 = b'b';
const TAG_INT: u8 = b'i';
const TAG_UINT: u8 = b'u';
const TAG_FLOAT: u8 = b'f';
const TAG_STR: u8 = b's';
const TAG_BYTES: u8 = b'y';
const TAG_SEQ: u8 = b'S';
const TAG_MAP: u8 = b'M';

/// Accumulates a canonical byte stream into a SHA-1 digest.
///
/// The caller feeds an entity's inputs in a declared order; `finish`
/// returns the hex-encoded digest. The encoder is infallible: anything
/// that cannot be expressed as a [`serde_json::Value`] must be rejected
/// before it gets here (see [`to_canonical_value`]).
pub struct Encoder {
    hasher: Sha1,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            hasher: Sha1::new(),
        }
    }

    fn token(&mut self, tag: u8, payload: &[u8]) {
        self.hasher.update([tag]);
        self.hasher.update((payload.len() as u64).to_le_bytes());
        self.hasher.update(payload);
    }

    /// The nil token. Distinct from `str("")`.
    pub fn nil(&mut self) -> &mut Self {
        self.token(TAG_NIL, &[]);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.token(TAG_BOOL, &[v as u8]);
        self
    }

    pub fn int(&mut self, v: i64) -> &mut Self {
        self.token(TAG_INT, &v.to_le_bytes());
        self
    }

    pub fn uint(&mut self, v: u64) -> &mut Self {
        self.token(TAG_UINT, &v.to_le_bytes());
        self
    }

    pub fn float(&mut self, v: f64) -> &mut Self {
        self.token(TAG_FLOAT, &v.to_le_bytes());
        self
    }

    pub fn str(&mut self, v: impl AsRef<str>) -> &mut Self {
        self.token(TAG_STR, v.as_ref().as_bytes());
        self
    }

    pub fn bytes(&mut self, v: impl AsRef<[u8]>) -> &mut Self {
        self.token(TAG_BYTES, v.as_ref());
        self
    }

    /// Open a sequence of `len` items. The caller must emit exactly that
    /// many tokens next, in declared order.
    pub fn seq(&mut self, len: usize) -> &mut Self {
        self.token(TAG_SEQ, &(len as u64).to_le_bytes());
        self
    }

    /// Open a mapping of `len` entries. The caller must emit the entries
    /// as alternating key and value tokens, keys sorted lexicographically.
    pub fn map(&mut self, len: usize) -> &mut Self {
        self.token(TAG_MAP, &(len as u64).to_le_bytes());
        self
    }

    /// Encode an arbitrary property value. Mappings are re-sorted by key
    /// regardless of their in-memory order.
    pub fn value(&mut self, v: &Value) -> &mut Self {
        match v {
            Value::Null => self.nil(),
            Value::Bool(b) => self.bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    self.int(i)
                } else if let Some(u) = n.as_u64() {
                    self.uint(u)
                } else {
                    // JSON numbers are never NaN or infinite.
                    self.float(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => self.str(s),
            Value::Array(items) => {
                self.seq(items.len());
                for item in items {
                    self.value(item);
                }
                self
            }
            Value::Object(entries) => {
                let sorted: BTreeMap<&String, &Value> = entries.iter().collect();
                self.map(sorted.len());
                for (k, v) in sorted {
                    self.str(k);
                    self.value(v);
                }
                self
            }
        }
    }

    /// Finalize the stream and return the hex-encoded SHA-1 digest.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex SHA-1 of a raw byte stream, for artifacts (package tarballs) whose
/// canonical form is their own contents.
pub fn sha1_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Normalize a parsed YAML value into the canonical property-value form.
///
/// YAML permits things the canonical encoding does not: non-scalar mapping
/// keys and application tags. Those fail with an encoding error; everything
/// else maps onto nil | bool | int | float | string | seq | map.
pub fn to_canonical_value(v: &serde_yaml::Value) -> Result<Value> {
    use serde_yaml::Value as Yaml;
    Ok(match v {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(*b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                let f = n.as_f64().context(EncodingSnafu {
                    reason: format!("number '{n}' is not representable"),
                })?;
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .context(EncodingSnafu {
                        reason: format!("float '{f}' is not finite"),
                    })?
            }
        }
        Yaml::String(s) => Value::String(s.clone()),
        Yaml::Sequence(items) => Value::Array(
            items
                .iter()
                .map(to_canonical_value)
                .collect::<Result<Vec<_>>>()?,
        ),
        Yaml::Mapping(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                let key = k.as_str().map(String::from).or_else(|| match k {
                    Yaml::Number(n) => Some(n.to_string()),
                    Yaml::Bool(b) => Some(b.to_string()),
                    _ => None,
                });
                let key = key.context(EncodingSnafu {
                    reason: "mapping key is not a scalar".to_string(),
                })?;
                map.insert(key, to_canonical_value(v)?);
            }
            Value::Object(map)
        }
        Yaml::Tagged(tagged) => {
            return EncodingSnafu {
                reason: format!("tagged value '{}' has no canonical form", tagged.tag),
            }
            .fail()
        }
    })
}
