//! The storage envelope: a cached value plus its write timestamp and TTL.
//!
//! Staleness is computed from the envelope, independent of any expiry feature
//! the underlying store may have. An envelope read at exactly its expiry
//! boundary is already expired.

use serde::{Deserialize, Serialize};

use crate::config::EncodingMode;
use crate::error::CacheError;

/// The value actually written to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The cached value.
    pub item: serde_json::Value,
    /// Write time, epoch milliseconds. Always positive for envelopes written
    /// by this client.
    pub stored: i64,
    /// Time to live in milliseconds. Non-positive values are stored as given
    /// and simply read back as already stale. Absent on entries written by
    /// other producers; such entries never expire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl Envelope {
    /// Wraps `item` with the current time and `ttl`.
    pub fn new(item: serde_json::Value, ttl: i64) -> Self {
        Self {
            item,
            stored: now_ms(),
            ttl: Some(ttl),
        }
    }

    /// True when the envelope has reached or passed its expiry boundary.
    /// Envelopes without a ttl never expire.
    pub fn is_stale(&self, now_ms: i64) -> bool {
        match self.ttl {
            Some(ttl) => now_ms - self.stored >= ttl,
            None => false,
        }
    }

    /// Encodes the envelope for the wire per `mode`.
    ///
    /// Utf8 serializes to a JSON text blob; json passes the structured value
    /// through for the wire codec to serialize.
    pub fn encode(&self, mode: EncodingMode) -> Result<serde_json::Value, CacheError> {
        match mode {
            EncodingMode::Utf8 => serde_json::to_string(self)
                .map(serde_json::Value::String)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            EncodingMode::Json => {
                serde_json::to_value(self).map_err(|e| CacheError::Serialization(e.to_string()))
            }
        }
    }

    /// Decodes a stored value per `mode`.
    ///
    /// Undecodable content fails with [`CacheError::Corrupt`]; content that
    /// decodes but lacks a truthy `item` or a positive `stored` fails with
    /// [`CacheError::IncorrectEnvelope`]. Both are distinct from a miss so
    /// callers can tell "not present" from "present but unreadable".
    pub fn decode(value: serde_json::Value, mode: EncodingMode) -> Result<Self, CacheError> {
        let structured = match mode {
            EncodingMode::Utf8 => {
                let serde_json::Value::String(text) = value else {
                    return Err(CacheError::Corrupt);
                };
                serde_json::from_str(&text).map_err(|_| CacheError::Corrupt)?
            }
            EncodingMode::Json => value,
        };
        Self::from_value(structured)
    }

    fn from_value(value: serde_json::Value) -> Result<Self, CacheError> {
        if is_falsy(&value) {
            return Err(CacheError::Corrupt);
        }
        let item = value.get("item").cloned().unwrap_or(serde_json::Value::Null);
        let stored = value.get("stored").and_then(serde_json::Value::as_i64).unwrap_or(0);
        // Only item and stored are validated; ttl is optional.
        let ttl = value.get("ttl").and_then(serde_json::Value::as_i64);
        if is_falsy(&item) || stored <= 0 {
            return Err(CacheError::IncorrectEnvelope);
        }
        Ok(Self { item, stored, ttl })
    }
}

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// The JavaScript falsy set reachable through a JSON value: null, false,
// numeric zero, and the empty string.
fn is_falsy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Bool(b) => !b,
        serde_json::Value::Number(n) => n.as_f64() == Some(0.0),
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}
