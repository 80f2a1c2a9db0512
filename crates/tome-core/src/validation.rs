//! # Validation Module
//!
//! Checks applied to identifiers and events before they reach a document
//! path or the persisted queue.
//!
//! ## Where Validation Happens
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Points                                  │
//! │                                                                         │
//! │  Outbound: ChangeCapture ──► validate_event ──► EventQueue             │
//! │            (rejects ids that cannot form a document path)              │
//! │                                                                         │
//! │  Inbound:  RemoteStore ──► RemoteDocument::decode ──► merge            │
//! │            (validate_entity_id on path id and embedded chapter keys)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tome_core::validation::validate_entity_id;
//!
//! assert!(validate_entity_id("manga_id", "md-1234").is_ok());
//! assert!(validate_entity_id("manga_id", "a/b").is_err());
//! ```

use crate::error::ValidationError;
use crate::event::SyncEvent;
use crate::MAX_ENTITY_ID_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates an identifier that will be used as a document path segment.
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_ENTITY_ID_LEN`] bytes
/// - No `/` (path separator) and no control characters
pub fn validate_entity_id(field: &str, id: &str) -> ValidationResult<()> {
    if id.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if id.len() > MAX_ENTITY_ID_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_ENTITY_ID_LEN,
        });
    }

    if id.contains('/') || id.chars().any(char::is_control) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not contain '/' or control characters".to_string(),
        });
    }

    Ok(())
}

/// Validates an epoch-millisecond timestamp.
pub fn validate_timestamp(field: &str, ms: i64) -> ValidationResult<()> {
    if ms < 0 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: i64::MAX,
        });
    }
    Ok(())
}

// =============================================================================
// Event Validators
// =============================================================================

/// Validates a captured event before it is queued.
pub fn validate_event(event: &SyncEvent) -> ValidationResult<()> {
    validate_entity_id("event.id", &event.id)?;
    validate_entity_id("event.entity_id", &event.entity_id)?;
    validate_timestamp("event.timestamp", event.timestamp)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EntityType, EventKind};

    #[test]
    fn test_entity_id_rules() {
        assert!(validate_entity_id("id", "m-1").is_ok());
        assert!(matches!(
            validate_entity_id("id", ""),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            validate_entity_id("id", &"x".repeat(MAX_ENTITY_ID_LEN + 1)),
            Err(ValidationError::TooLong { .. })
        ));
        assert!(matches!(
            validate_entity_id("id", "users/evil"),
            Err(ValidationError::InvalidFormat { .. })
        ));
        assert!(validate_entity_id("id", "line\nbreak").is_err());
    }

    #[test]
    fn test_negative_timestamp_rejected() {
        assert!(validate_timestamp("t", 0).is_ok());
        assert!(validate_timestamp("t", -1).is_err());
    }

    #[test]
    fn test_validate_event() {
        let ok = SyncEvent::new(
            EntityType::Manga,
            "m1",
            EventKind::Update,
            serde_json::Value::Null,
            10,
            1,
        );
        assert!(validate_event(&ok).is_ok());

        let bad = SyncEvent::new(
            EntityType::Manga,
            "",
            EventKind::Update,
            serde_json::Value::Null,
            10,
            1,
        );
        assert!(validate_event(&bad).is_err());
    }
}
