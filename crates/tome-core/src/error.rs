//! # Error Types
//!
//! Domain-specific error types for tome-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CoreError                                      │
//! │                                                                         │
//! │  ┌─────────────────────┐  ┌─────────────────────┐  ┌─────────────────┐ │
//! │  │  UnknownEntityType  │  │  MalformedDocument  │  │ PayloadMismatch │ │
//! │  │                     │  │                     │  │                 │ │
//! │  │  "comment" is not   │  │  remote JSON that   │  │ event payload   │ │
//! │  │  a synced entity    │  │  fails to decode    │  │ does not match  │ │
//! │  │                     │  │  or validate        │  │ its entity type │ │
//! │  └─────────────────────┘  └─────────────────────┘  └─────────────────┘ │
//! │                                                                         │
//! │  ┌───────────────────────────────────────────────────────────────────┐ │
//! │  │                     ValidationError                               │ │
//! │  │   Required · TooLong · InvalidFormat · OutOfRange                 │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (collection, document id, field)
//! 3. Errors are enum variants, never String
//! 4. A malformed remote document is an error value, never a panic

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity type string is not one of the synced collections.
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Remote document could not be decoded or failed validation.
    ///
    /// ## When This Occurs
    /// - Another client wrote a document with a missing/renamed field
    /// - A document id does not match the id stored inside it
    /// - A chapter map key does not match the chapter's own id
    ///
    /// The engine skips the offending document; the rest of the batch
    /// continues.
    #[error("Malformed {collection} document '{id}': {reason}")]
    MalformedDocument {
        collection: String,
        id: String,
        reason: String,
    },

    /// An event payload cannot be read as its declared entity type.
    #[error("Payload for {entity_type} '{entity_id}' is invalid: {reason}")]
    PayloadMismatch {
        entity_type: String,
        entity_id: String,
        reason: String,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates a MalformedDocument error.
    pub fn malformed(
        collection: impl Into<String>,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        CoreError::MalformedDocument {
            collection: collection.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Field value has an invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },
}
