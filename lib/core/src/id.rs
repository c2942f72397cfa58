//! Strongly-typed identifiers.
//!
//! Every identifier wraps a ULID and renders as `<prefix>_<ulid>`, so ids are
//! sortable by creation time and an id of one kind is never mistaken for
//! another in logs or API payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The identifier type that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a fresh identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Wraps an existing ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the display prefix.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ulid::from_str(raw).map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    reason: e.to_string(),
                })
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseIdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

define_id!(
    /// Identifies one configured integration.
    IntegrationId,
    "int"
);

define_id!(
    /// Identifies an owner scope (account or tenant).
    OwnerId,
    "own"
);

define_id!(
    /// Identifies one audit log entry.
    AuditEntryId,
    "aud"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_prefix() {
        assert!(IntegrationId::new().to_string().starts_with("int_"));
        assert!(OwnerId::new().to_string().starts_with("own_"));
        assert!(AuditEntryId::new().to_string().starts_with("aud_"));
    }

    #[test]
    fn parse_with_and_without_prefix() {
        let id = IntegrationId::new();
        let with_prefix: IntegrationId = id.to_string().parse().expect("prefixed");
        let bare: IntegrationId = id.as_ulid().to_string().parse().expect("bare");
        assert_eq!(id, with_prefix);
        assert_eq!(id, bare);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "int_nope".parse::<IntegrationId>().unwrap_err();
        assert_eq!(err.id_type, "IntegrationId");
    }

    #[test]
    fn serde_uses_prefixed_form() {
        let id = OwnerId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
        let parsed: OwnerId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, id);
    }

    #[test]
    fn ids_order_by_creation() {
        let first = AuditEntryId::from_ulid(Ulid::from_parts(1, 0));
        let second = AuditEntryId::from_ulid(Ulid::from_parts(2, 0));
        assert!(first < second);
    }
}
