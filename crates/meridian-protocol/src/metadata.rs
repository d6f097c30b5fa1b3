//! Call metadata and trace carriers.
//!
//! [`MetadataMap`] is the string-keyed multi-map that travels with a native
//! RPC call. Keys are case-insensitive and stored lower-cased. Keys ending in
//! [`BINARY_SUFFIX`] hold binary content, base64-encoded on the wire.
//!
//! [`Carrier`] abstracts over anything a trace context can be written into or
//! read from: RPC metadata and HTTP header maps both implement it.

use std::borrow::Cow;
use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Deserializer, Serialize};

/// Reserved key suffix marking binary-valued entries.
pub const BINARY_SUFFIX: &str = "-bin";

#[derive(Debug, thiserror::Error)]
pub enum CarrierError {
    #[error("metadata key {key} does not hold valid base64: {source}")]
    InvalidBinary {
        key: String,
        #[source]
        source: base64::DecodeError,
    },
}

/// Returns `key` with the binary suffix appended when it is missing.
pub fn binary_key(key: &str) -> Cow<'_, str> {
    if key.ends_with(BINARY_SUFFIX) {
        Cow::Borrowed(key)
    } else {
        Cow::Owned(format!("{key}{BINARY_SUFFIX}"))
    }
}

fn decode_binary(key: &str, value: &str) -> Result<Vec<u8>, CarrierError> {
    STANDARD
        .decode(value)
        .or_else(|_| STANDARD_NO_PAD.decode(value))
        .map_err(|source| CarrierError::InvalidBinary {
            key: key.to_string(),
            source,
        })
}

/// Something trace context can be injected into and extracted from.
pub trait Carrier {
    /// First value stored under `key`.
    fn get(&self, key: &str) -> Option<&str>;

    /// Replace the values stored under `key`.
    fn set(&mut self, key: &str, value: String);

    fn keys(&self) -> Vec<String>;

    /// Store binary content; the key is forced to end with [`BINARY_SUFFIX`]
    /// and the value is base64-encoded.
    fn set_binary(&mut self, key: &str, value: &[u8]) {
        let key = binary_key(key);
        self.set(&key, STANDARD.encode(value));
    }

    /// Read and decode binary content stored with [`Carrier::set_binary`].
    fn get_binary(&self, key: &str) -> Result<Option<Vec<u8>>, CarrierError> {
        let key = binary_key(key);
        match self.get(&key) {
            Some(value) => decode_binary(&key, value).map(Some),
            None => Ok(None),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MetadataMap
// ─────────────────────────────────────────────────────────────────────────────

/// RPC call metadata: lower-cased keys, one or more string values per key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MetadataMap {
    entries: BTreeMap<String, Vec<String>>,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values under `key`.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Add a value under `key`, keeping existing ones.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        let key = key.to_ascii_lowercase();
        self.entries.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn insert_bin(&mut self, key: &str, value: &[u8]) {
        self.set_binary(key, value);
    }

    pub fn get_bin(&self, key: &str) -> Result<Option<Vec<u8>>, CarrierError> {
        self.get_binary(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Build metadata from HTTP request headers. Non-UTF-8 values are skipped.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut md = Self::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                md.append(name.as_str(), value);
            }
        }
        md
    }

    /// Render metadata as HTTP headers. Entries that are not valid header
    /// names or values are skipped.
    pub fn to_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, value) in self.iter() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            headers.append(name, value);
        }
        headers
    }
}

impl Carrier for MetadataMap {
    fn get(&self, key: &str) -> Option<&str> {
        MetadataMap::get(self, key)
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key, value);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireValues {
    One(String),
    Many(Vec<String>),
}

impl<'de> Deserialize<'de> for MetadataMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, WireValues>::deserialize(deserializer)?;
        let mut md = MetadataMap::new();
        for (key, values) in raw {
            match values {
                WireValues::One(v) => md.append(&key, v),
                WireValues::Many(vs) => {
                    for v in vs {
                        md.append(&key, v);
                    }
                }
            }
        }
        Ok(md)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for MetadataMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = MetadataMap::new();
        for (k, v) in iter {
            md.append(k.as_ref(), v);
        }
        md
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP headers
// ─────────────────────────────────────────────────────────────────────────────

impl Carrier for HeaderMap {
    fn get(&self, key: &str) -> Option<&str> {
        HeaderMap::get(self, key).and_then(|v| v.to_str().ok())
    }

    fn set(&mut self, key: &str, value: String) {
        let Ok(name) = HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes()) else {
            return;
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            self.insert(name, value);
        }
    }

    fn keys(&self) -> Vec<String> {
        HeaderMap::keys(self).map(|k| k.as_str().to_string()).collect()
    }
}
