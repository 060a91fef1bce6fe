//! Implementation of the canonical UUID wrapper.

use crate::{UuidError, UuidResult};
use std::{fmt, str::FromStr};

/// Re-exported for convenience.
pub use ::uuid::Uuid;

/// A UUID guaranteed to be in canonical form (32 lowercase hex characters, no hyphens).
///
/// Once constructed, the contained UUID is valid and always renders canonically, so callers can
/// compare and persist the string form without normalising it first.
///
/// # Construction
/// - [`CanonicalUuid::new`] generates a new random (v4) identifier.
/// - [`CanonicalUuid::parse`] validates an externally supplied identifier.
///
/// # Errors
/// [`CanonicalUuid::parse`] returns [`UuidError::InvalidInput`] if the input is not already
/// canonical.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalUuid(Uuid);

impl Default for CanonicalUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl CanonicalUuid {
    /// Generates a new random identifier in canonical form.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Validates and parses a UUID string that must already be in canonical form.
    ///
    /// This does **not** normalise other common UUID forms (for example, hyphenated or uppercase).
    ///
    /// # Arguments
    ///
    /// * `input` - UUID string to validate and wrap. Must be exactly 32 lowercase hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`UuidError::InvalidInput`] if `input` is not in canonical form.
    pub fn parse(input: &str) -> UuidResult<Self> {
        if !Self::is_canonical(input) {
            return Err(UuidError::InvalidInput(format!(
                "UUID must be 32 lowercase hex characters without hyphens, got: '{}'",
                input
            )));
        }
        Uuid::parse_str(input)
            .map(Self)
            .map_err(|e| UuidError::InvalidInput(e.to_string()))
    }

    /// Returns true if `input` is in canonical UUID form.
    ///
    /// This is a purely syntactic check:
    /// - Exactly 32 bytes long
    /// - Contains only lowercase hex characters (`0-9` and `a-f`)
    pub fn is_canonical(input: &str) -> bool {
        input.len() == 32
            && input
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for CanonicalUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for CanonicalUuid {
    type Err = UuidError;

    /// Equivalent to [`CanonicalUuid::parse`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalUuid::parse(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for CanonicalUuid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for CanonicalUuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        CanonicalUuid::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_generates_valid_uuid() {
        let id = CanonicalUuid::new();
        let canonical = id.to_string();

        assert_eq!(canonical.len(), 32);
        assert!(CanonicalUuid::is_canonical(&canonical));
    }

    #[test]
    fn test_parse_valid_canonical_uuid() {
        let canonical = "550e8400e29b41d4a716446655440000";
        let parsed = CanonicalUuid::parse(canonical).expect("canonical input should parse");

        assert_eq!(parsed.to_string(), canonical);
    }

    #[test]
    fn test_parse_rejects_hyphenated_uuid() {
        let hyphenated = "550e8400-e29b-41d4-a716-446655440000";

        match CanonicalUuid::parse(hyphenated) {
            Err(UuidError::InvalidInput(msg)) => {
                assert!(msg.contains("32 lowercase hex characters"));
            }
            other => panic!("Expected InvalidInput error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_uppercase_and_bad_lengths() {
        assert!(CanonicalUuid::parse("550E8400E29B41D4A716446655440000").is_err());
        assert!(CanonicalUuid::parse("550e8400e29b41d4a71644665544000").is_err());
        assert!(CanonicalUuid::parse("550e8400e29b41d4a7164466554400000").is_err());
        assert!(CanonicalUuid::parse("550e8400e29b41d4a716446655440zzz").is_err());
        assert!(CanonicalUuid::parse("").is_err());
    }

    #[test]
    fn test_serde_uses_canonical_string() {
        let id = CanonicalUuid::parse("550e8400e29b41d4a716446655440000").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"550e8400e29b41d4a716446655440000\"");

        let err = serde_json::from_str::<CanonicalUuid>("\"550e8400-e29b-41d4-a716-446655440000\"");
        assert!(err.is_err());
    }
}
