//! Log and event types emitted by a running simulation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stats::StatisticsSnapshot;

/// Severity/category of a user-facing log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    /// Carries a payload sample in [`LogEntry::data`].
    Data,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Data => "data",
        }
    }
}

/// One line of the run's log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    #[serde(rename = "type")]
    pub level: LogLevel,
    /// Local wall-clock time, `HH:MM:SS`.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            data: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    /// A log line carrying a JSON sample.
    pub fn data(message: impl Into<String>, data: Value) -> Self {
        Self::new(LogLevel::Data, message).with_data(data)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Everything a run reports to its observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum SimulationEvent {
    Log(LogEntry),
    Stats(StatisticsSnapshot),
}

impl SimulationEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            SimulationEvent::Log(_) => "log",
            SimulationEvent::Stats(_) => "stats",
        }
    }
}
