//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Remote (a)     │  │  Validation (b)         │ │
//! │  │                 │  │  retried with   │  │  document skipped       │ │
//! │  │  InvalidConfig  │  │  backoff        │  │                         │ │
//! │  │  ConfigLoad/Save│  │  Unavailable    │  │  InvalidDocument        │ │
//! │  │                 │  │  Timeout        │  │  InvalidPayload         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Capacity (c)   │  │  Auth (d)       │  │  Local / Merge (e)      │ │
//! │  │  event dropped  │  │  flush suspended│  │  entity skipped         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  QueueFull      │  │ Unauthenticated │  │  LocalWriteFailed       │ │
//! │  │                 │  │  NoUser         │  │  Persistence            │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing escapes the engine's background tasks: every category above is
//! logged and reflected in `SyncState` instead.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote store could not be reached or rejected the request
    /// for a transient reason.
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// A remote operation did not finish within its deadline.
    #[error("Remote operation timed out after {0} ms")]
    Timeout(u64),

    /// The remote store rejected a write permanently (bad path, rules).
    #[error("Remote store rejected write: {0}")]
    RemoteRejected(String),

    /// The realtime change stream ended.
    #[error("Change stream for {0} closed")]
    StreamClosed(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// A remote document could not be decoded.
    #[error("Invalid remote document: {0}")]
    InvalidDocument(String),

    /// A queued event's payload cannot be turned into a remote write.
    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    // =========================================================================
    // Capacity Errors
    // =========================================================================
    /// The event queue is at capacity and the event's key is new.
    #[error("Event queue full ({max_size} events)")]
    QueueFull { max_size: usize },

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// The remote store rejected the session credential.
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    /// No user is signed in.
    #[error("No signed-in user")]
    NoUser,

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// The host's local database rejected a write.
    #[error("Local write failed: {0}")]
    LocalWriteFailed(String),

    /// The host's local database could not be read.
    #[error("Local read failed: {0}")]
    LocalReadFailed(String),

    /// Persisting the engine's own state failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization of persisted state failed.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A background task has shut down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tome_store::StoreError> for SyncError {
    fn from(err: tome_store::StoreError) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

impl From<tome_core::CoreError> for SyncError {
    fn from(err: tome_core::CoreError) -> Self {
        use tome_core::CoreError;
        match err {
            CoreError::MalformedDocument { .. } => SyncError::InvalidDocument(err.to_string()),
            CoreError::PayloadMismatch { .. } | CoreError::Validation(_) => {
                SyncError::InvalidPayload(err.to_string())
            }
            CoreError::UnknownEntityType(_) => SyncError::InvalidPayload(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Remote unavailable (network issues, 5xx)
    /// - Timeouts
    /// - Closed change streams
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable(_) | SyncError::Timeout(_) | SyncError::StreamClosed(_)
        )
    }

    /// Returns true if the session must be re-established before syncing.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::Unauthenticated(_) | SyncError::NoUser)
    }

    /// Returns true if the queue is at capacity.
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, SyncError::QueueFull { .. })
    }

    /// Returns true if a single document or event is at fault.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidDocument(_) | SyncError::InvalidPayload(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
