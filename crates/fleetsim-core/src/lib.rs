//! Core types for the fleetsim device-fleet simulator.
//!
//! This crate holds the run configuration, the error taxonomy, the log and
//! statistics event types, and the sinks a run reports through.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod stats;

pub use config::{
    AdvancedConfig, BasicConfig, CredentialPrefixes, CustomKeyDef, DataFormat, DataSettings,
    EngineSettings, FieldType, GroupConfig, MqttSettings, Qos, SimulationConfig, SimulationMode,
    TemplatePolicy, TypeRatio, env_vars,
};
pub use error::{ConfigError, Result, SimError};
pub use event::{LogEntry, LogLevel, SimulationEvent};
pub use eventbus::{
    DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver, EventSink, RunSink, TracingSink,
};
pub use stats::{StatisticsCollector, StatisticsSnapshot, StatsDelta};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{SimulationConfig, SimulationMode};
    pub use crate::error::{ConfigError, Result, SimError};
    pub use crate::event::{LogEntry, LogLevel};
    pub use crate::eventbus::EventSink;
    pub use crate::stats::{StatisticsCollector, StatisticsSnapshot};
}
