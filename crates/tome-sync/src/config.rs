//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TOME_SYNC_BATCH_SIZE=100                                           │
//! │     TOME_DEVICE_ID=abc-123                                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tome/sync.toml (Linux)                                   │
//! │     ~/Library/Application Support/app.tome.Tome/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, 1s/3s debounce, 3x backoff up to 15s     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Tablet"
//!
//! [sync]
//! batch_size = 50
//! flush_debounce_ms = 2000
//! periodic_interval_secs = 300
//! max_retries = 5
//!
//! [capture]
//! default_delay_ms = 1000
//! chapter_delay_ms = 3000
//!
//! [realtime]
//! enabled = true
//! echo_window_ms = 10000
//!
//! [storage]
//! path = "/var/lib/tome/sync.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tome_core::EntityType;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name, shown in the account's device list.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Tome Reader".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Outbound flush and download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Events taken from the queue per flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on writes per remote batch. The remote store's own
    /// ceiling applies when it is lower.
    #[serde(default = "default_max_batch_operations")]
    pub max_batch_operations: usize,

    /// Idle time after the last queue change before an automatic flush.
    #[serde(default = "default_flush_debounce")]
    pub flush_debounce_ms: u64,

    /// Periodic flush interval while the app is in the foreground.
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_secs: u64,

    /// Write attempts per event across flushes before it is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Maximum number of pending events.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// First backoff delay within one flush (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff growth factor.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Longest backoff delay (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Attempts per remote batch within one flush.
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,

    /// Deadline for a single remote operation (milliseconds).
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Most-recent history entries fetched by a full download.
    #[serde(default = "default_history_limit")]
    pub history_download_limit: usize,
}

fn default_batch_size() -> usize {
    100
}
fn default_max_batch_operations() -> usize {
    500
}
fn default_flush_debounce() -> u64 {
    2_000
}
fn default_periodic_interval() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    5
}
fn default_max_queue_size() -> usize {
    10_000
}
fn default_initial_backoff() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    3.0
}
fn default_max_backoff() -> u64 {
    15_000
}
fn default_commit_attempts() -> u32 {
    3
}
fn default_operation_timeout() -> u64 {
    15_000
}
fn default_history_limit() -> usize {
    500
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            batch_size: default_batch_size(),
            max_batch_operations: default_max_batch_operations(),
            flush_debounce_ms: default_flush_debounce(),
            periodic_interval_secs: default_periodic_interval(),
            max_retries: default_max_retries(),
            max_queue_size: default_max_queue_size(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff(),
            commit_attempts: default_commit_attempts(),
            operation_timeout_ms: default_operation_timeout(),
            history_download_limit: default_history_limit(),
        }
    }
}

impl SyncSettings {
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

// =============================================================================
// Capture Settings
// =============================================================================

/// Debounce delays for captured local changes.
///
/// Reading progress changes page by page, so chapters wait longer before an
/// event is queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Delay for manga, category and settings changes (milliseconds).
    #[serde(default = "default_capture_delay")]
    pub default_delay_ms: u64,

    /// Delay for chapter changes (milliseconds).
    #[serde(default = "default_chapter_delay")]
    pub chapter_delay_ms: u64,

    /// Delay for history changes (milliseconds).
    #[serde(default = "default_history_delay")]
    pub history_delay_ms: u64,
}

fn default_capture_delay() -> u64 {
    1_000
}
fn default_chapter_delay() -> u64 {
    3_000
}
fn default_history_delay() -> u64 {
    3_000
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettings {
            default_delay_ms: default_capture_delay(),
            chapter_delay_ms: default_chapter_delay(),
            history_delay_ms: default_history_delay(),
        }
    }
}

impl CaptureSettings {
    /// Debounce delay for an entity type.
    pub fn delay_for(&self, entity_type: EntityType) -> Duration {
        let ms = match entity_type {
            EntityType::Chapter => self.chapter_delay_ms,
            EntityType::History => self.history_delay_ms,
            EntityType::Manga | EntityType::Category | EntityType::Settings => {
                self.default_delay_ms
            }
        };
        Duration::from_millis(ms)
    }
}

// =============================================================================
// Realtime Settings
// =============================================================================

/// Standing listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    /// Start listeners after sign-in.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long our own writes are remembered for echo suppression.
    #[serde(default = "default_echo_window")]
    pub echo_window_ms: u64,

    /// First reconnect delay (milliseconds).
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Longest reconnect delay (milliseconds).
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_echo_window() -> u64 {
    10_000
}
fn default_reconnect_initial() -> u64 {
    1_000
}
fn default_reconnect_max() -> u64 {
    60_000
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        RealtimeSettings {
            enabled: true,
            echo_window_ms: default_echo_window(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

impl RealtimeSettings {
    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Where the engine persists its own state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file for the queue snapshot and metadata.
    /// Defaults to `sync.db` in the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Keep state in memory only (nothing survives a restart).
    #[serde(default)]
    pub in_memory: bool,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Flush and download settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Change capture debounce settings.
    #[serde(default)]
    pub capture: CaptureSettings,

    /// Realtime listener settings.
    #[serde(default)]
    pub realtime: RealtimeSettings,

    /// Local persistence settings.
    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::InvalidConfig("device.id must not be empty".into()));
        }

        let sync = &self.sync;
        if sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }
        if sync.max_batch_operations == 0 {
            return Err(SyncError::InvalidConfig(
                "max_batch_operations must be greater than 0".into(),
            ));
        }
        if sync.max_retries == 0 || sync.commit_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_retries and commit_attempts must be at least 1".into(),
            ));
        }
        if sync.max_queue_size == 0 {
            return Err(SyncError::InvalidConfig(
                "max_queue_size must be greater than 0".into(),
            ));
        }
        if sync.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                sync.backoff_multiplier
            )));
        }
        if sync.initial_backoff_ms > sync.max_backoff_ms {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must not exceed max_backoff_ms".into(),
            ));
        }
        if sync.operation_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "operation_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.realtime.reconnect_initial_ms > self.realtime.reconnect_max_ms {
            return Err(SyncError::InvalidConfig(
                "reconnect_initial_ms must not exceed reconnect_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies `TOME_*` overrides from an arbitrary lookup.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(id) = var("TOME_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = var("TOME_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(size) = var("TOME_SYNC_BATCH_SIZE") {
            match size.parse() {
                Ok(n) => self.sync.batch_size = n,
                Err(_) => warn!(value = %size, "Invalid TOME_SYNC_BATCH_SIZE"),
            }
        }

        if let Some(retries) = var("TOME_SYNC_MAX_RETRIES") {
            match retries.parse() {
                Ok(n) => self.sync.max_retries = n,
                Err(_) => warn!(value = %retries, "Invalid TOME_SYNC_MAX_RETRIES"),
            }
        }

        if let Some(ms) = var("TOME_SYNC_DEBOUNCE_MS") {
            if let Ok(ms) = ms.parse() {
                self.sync.flush_debounce_ms = ms;
            }
        }

        if let Some(secs) = var("TOME_SYNC_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                self.sync.periodic_interval_secs = secs;
            }
        }

        if let Some(enabled) = var("TOME_REALTIME_ENABLED") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.realtime.enabled = true,
                "0" | "false" | "no" => self.realtime.enabled = false,
                _ => warn!(value = %enabled, "Invalid TOME_REALTIME_ENABLED"),
            }
        }

        if let Some(path) = var("TOME_STORE_PATH") {
            debug!(path = %path, "Overriding store path from environment");
            self.storage.path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("app", "tome", "Tome")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Returns the store path: configured, or `sync.db` in the data directory.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.storage.path.clone().or_else(|| {
            directories::ProjectDirs::from("app", "tome", "Tome")
                .map(|dirs| dirs.data_dir().join("sync.db"))
        })
    }

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }
}
