//! Cache error types.

use thiserror::Error;

use crate::config::ConfigError;
use levelcache_transport::TransportError;

/// Errors surfaced by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An operation was issued before `start` succeeded (or after `stop`).
    #[error("cache client not started")]
    NotStarted,

    /// The segment name was empty.
    #[error("empty string")]
    EmptySegment,

    /// The segment name contained a NUL character.
    #[error("includes null character")]
    ForbiddenCharacter,

    /// A stored value could not be decoded at all.
    #[error("bad envelope content")]
    Corrupt,

    /// A stored value decoded but is not a valid envelope.
    #[error("incorrect envelope structure")]
    IncorrectEnvelope,

    /// The value handed to `set` could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The connection attempt failed or was reported dead before readiness.
    #[error("{0}")]
    Connection(String),

    /// Error from the transport stack.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Convenience alias used throughout the cache crate.
pub type Result<T> = std::result::Result<T, CacheError>;
