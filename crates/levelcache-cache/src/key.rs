//! Storage-key construction and segment-name validation.
//!
//! A storage key is built deterministically from the optional partition, the
//! key's segment, and its id, each percent-encoded and joined with `!`. The
//! encode set always escapes `!` inside components, so the separator can never
//! appear in encoded output and the mapping stays unambiguous.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::CacheError;

/// Separator between storage-key components.
pub const KEY_SEPARATOR: char = '!';

// Everything outside [A-Za-z0-9-_.~*'()] is escaped; note that this includes
// the '!' separator itself.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// An application-level cache key: a validated segment plus an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Application namespace for the key.
    pub segment: String,
    /// Identifier within the segment.
    pub id: String,
}

impl CacheKey {
    /// Creates a cache key.
    pub fn new(segment: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            id: id.into(),
        }
    }
}

/// Builds the storage key for `key`, optionally under `partition`.
///
/// Components are encoded then joined in order: partition, segment, id.
/// Absent components drop out together with their separator.
pub fn storage_key(partition: Option<&str>, key: &CacheKey) -> String {
    let mut out = String::new();
    if let Some(partition) = partition {
        out.push_str(&utf8_percent_encode(partition, COMPONENT).to_string());
        out.push(KEY_SEPARATOR);
    }
    if !key.segment.is_empty() {
        out.push_str(&utf8_percent_encode(&key.segment, COMPONENT).to_string());
        out.push(KEY_SEPARATOR);
    }
    out.push_str(&utf8_percent_encode(&key.id, COMPONENT).to_string());
    out
}

/// Validates a segment name: non-empty and free of NUL characters.
///
/// Pure function; usable independent of connection state. The surrounding
/// policy layer runs this once when a segment is registered, not on every
/// operation.
pub fn validate_segment_name(name: &str) -> Result<(), CacheError> {
    if name.is_empty() {
        return Err(CacheError::EmptySegment);
    }
    if name.contains('\0') {
        return Err(CacheError::ForbiddenCharacter);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_full() {
        let key = CacheKey::new("segment", "id");
        assert_eq!(storage_key(Some("partition"), &key), "partition!segment!id");
    }

    #[test]
    fn test_storage_key_without_partition() {
        let key = CacheKey::new("segment", "id");
        assert_eq!(storage_key(None, &key), "segment!id");
    }

    #[test]
    fn test_storage_key_without_segment() {
        let key = CacheKey::new("", "id");
        assert_eq!(storage_key(Some("p"), &key), "p!id");
        assert_eq!(storage_key(None, &key), "id");
    }

    #[test]
    fn test_storage_key_escapes_separator_in_components() {
        let key = CacheKey::new("se!g", "i!d");
        assert_eq!(storage_key(Some("p!art"), &key), "p%21art!se%21g!i%21d");
    }

    #[test]
    fn test_storage_key_escapes_reserved_characters() {
        let key = CacheKey::new("a b", "c/d");
        assert_eq!(storage_key(None, &key), "a%20b!c%2Fd");
    }

    #[test]
    fn test_storage_key_keeps_unreserved_characters() {
        let key = CacheKey::new("A-Z_0.9~", "*'()");
        assert_eq!(storage_key(None, &key), "A-Z_0.9~!*'()");
    }

    #[test]
    fn test_storage_key_is_deterministic() {
        let key = CacheKey::new("s", "i");
        assert_eq!(
            storage_key(Some("p"), &key),
            storage_key(Some("p"), &key.clone())
        );
    }

    #[test]
    fn test_validate_segment_name_empty() {
        assert!(matches!(
            validate_segment_name(""),
            Err(CacheError::EmptySegment)
        ));
    }

    #[test]
    fn test_validate_segment_name_nul() {
        assert!(matches!(
            validate_segment_name("a\0b"),
            Err(CacheError::ForbiddenCharacter)
        ));
    }

    #[test]
    fn test_validate_segment_name_ok() {
        assert!(validate_segment_name("valid").is_ok());
        assert!(validate_segment_name("with spaces and !").is_ok());
    }
}
