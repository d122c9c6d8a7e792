#![warn(missing_docs)]

//! levelcache cache subsystem: the public cache contract over the remote
//! key/value store. Wraps values in a TTL envelope, builds namespaced storage
//! keys, and evaluates staleness on read.

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod key;

pub use client::CacheClient;
pub use config::{ClientSettings, ConfigError, EncodingMode};
pub use envelope::Envelope;
pub use error::{CacheError, Result};
pub use key::{storage_key, validate_segment_name, CacheKey};
