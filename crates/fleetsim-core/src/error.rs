//! Error types for the fleet simulator.

use thiserror::Error;

/// Result alias used across the simulator crates.
pub type Result<T> = std::result::Result<T, SimError>;

/// Top-level simulator error.
///
/// Only configuration failures and double starts are surfaced to the caller
/// of `start`; everything that happens once devices are running is absorbed
/// into log entries and statistics.
#[derive(Debug, Error)]
pub enum SimError {
    /// The simulation config was rejected before any device started
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A run is already active on this controller
    #[error("Simulation is already running")]
    AlreadyRunning,

    /// No run is active
    #[error("Simulation is not running")]
    NotRunning,

    /// Payload or config (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A worker partition could not be spawned or failed
    #[error("Worker {worker_id} error: {message}")]
    Worker { worker_id: usize, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration validation failures.
///
/// `scope` is `"basic"` for the root config or the group name in advanced
/// mode.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("MQTT host must not be empty")]
    EmptyHost,

    #[error("MQTT topic must not be empty")]
    EmptyTopic,

    #[error("Advanced mode requires at least one group")]
    NoGroups,

    #[error("Group name must not be empty")]
    EmptyGroupName,

    #[error("Duplicate group name: {0}")]
    DuplicateGroup(String),

    #[error("[{scope}] device range is empty: start {start} > end {end}")]
    EmptyRange { scope: String, start: u32, end: u32 },

    #[error("[{scope}] {custom} custom keys must be fewer than the total key count {total}")]
    TooManyCustomKeys {
        scope: String,
        custom: usize,
        total: usize,
    },

    #[error("[{scope}] {field} must be a positive number of seconds no longer than one day, got {value}")]
    InvalidInterval {
        scope: String,
        field: &'static str,
        value: f64,
    },

    #[error("[{scope}] {field} must be within [0, 1], got {value}")]
    InvalidRatio {
        scope: String,
        field: &'static str,
        value: f64,
    },

    #[error("[{scope}] type ratio {field} must be a non-negative number, got {value}")]
    InvalidWeight {
        scope: String,
        field: &'static str,
        value: f64,
    },

    #[error("[{scope}] custom key name must not be empty")]
    EmptyCustomKeyName { scope: String },

    #[error("[{scope}] duplicate custom key: {name}")]
    DuplicateCustomKey { scope: String, name: String },

    #[error("[{scope}] custom key {name}: min {min} is greater than max {max}")]
    InvalidBounds {
        scope: String,
        name: String,
        min: f64,
        max: f64,
    },
}
