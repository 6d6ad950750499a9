//! Clone identifiers.
//!
//! A clone id is `<source identifier>_<creation millis since UNIX epoch>` and
//! doubles as the clone's directory name under the storage root. Parsing
//! splits at the *last* `_` so identifiers that themselves contain `_` still
//! round-trip.

use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;

/// Separator between the source identifier and the timestamp.
pub const SEPARATOR: char = '_';

/// Why an identifier can not be used as a directory name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsafeIdentifier {
    Empty,
    PathSeparator,
    ParentReference,
    Hidden,
}

impl std::fmt::Display for UnsafeIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::Empty => "identifier is empty",
            Self::PathSeparator => "identifier contains a path separator",
            Self::ParentReference => "identifier contains '..'",
            Self::Hidden => "identifier starts with '.'",
        };
        f.write_str(msg)
    }
}

/// Check that an identifier is a safe single path segment.
pub fn validate_identifier(identifier: &str) -> Result<(), UnsafeIdentifier> {
    if identifier.is_empty() {
        return Err(UnsafeIdentifier::Empty);
    }
    if identifier.contains('/') || identifier.contains('\\') || identifier.contains('\0') {
        return Err(UnsafeIdentifier::PathSeparator);
    }
    if identifier.contains("..") {
        return Err(UnsafeIdentifier::ParentReference);
    }
    if identifier.starts_with('.') {
        return Err(UnsafeIdentifier::Hidden);
    }
    Ok(())
}

pub fn format_clone_id(source_identifier: &str, created_millis: u64) -> String {
    format!("{source_identifier}{SEPARATOR}{created_millis}")
}

/// Split a clone id (or directory name) into `(source identifier, millis)`.
pub fn parse_clone_id(clone_id: &str) -> Option<(&str, u64)> {
    let (identifier, millis) = clone_id.rsplit_once(SEPARATOR)?;
    if identifier.is_empty() || millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let millis = millis.parse().ok()?;
    Some((identifier, millis))
}

/// Current wall clock in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timestamp for a creation time encoded in a clone id.
pub fn created_at_from_millis(millis: u64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identifier_with_underscores() {
        let id = format_clone_id("org.my_vendor.tool", 1_700_000_000_123);
        assert_eq!(id, "org.my_vendor.tool_1700000000123");
        assert_eq!(
            parse_clone_id(&id),
            Some(("org.my_vendor.tool", 1_700_000_000_123))
        );
    }

    #[test]
    fn rejects_malformed_ids() {
        assert_eq!(parse_clone_id("com.example.app"), None);
        assert_eq!(parse_clone_id("com.example.app_"), None);
        assert_eq!(parse_clone_id("_123"), None);
        assert_eq!(parse_clone_id("com.example.app_12a"), None);
        assert_eq!(parse_clone_id("com.example.app_+12"), None);
    }

    #[test]
    fn validates_identifiers() {
        assert!(validate_identifier("com.example.app").is_ok());
        assert_eq!(validate_identifier(""), Err(UnsafeIdentifier::Empty));
        assert_eq!(
            validate_identifier("a/b"),
            Err(UnsafeIdentifier::PathSeparator)
        );
        assert_eq!(
            validate_identifier("a..b"),
            Err(UnsafeIdentifier::ParentReference)
        );
        assert_eq!(validate_identifier(".hidden"), Err(UnsafeIdentifier::Hidden));
    }

    #[test]
    fn millis_convert_to_timestamp() {
        let ts = created_at_from_millis(1_500);
        assert_eq!(ts.unix_timestamp(), 1);
        assert_eq!(ts.millisecond(), 500);
    }
}
