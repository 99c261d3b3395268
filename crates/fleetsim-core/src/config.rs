//! Simulation configuration model.
//!
//! A run is described by one [`SimulationConfig`]: the broker settings shared
//! by every device plus a [`SimulationMode`] that is either a flat device
//! range (`basic`) or a list of independently configured groups
//! (`advanced`). The mode is resolved once by serde's `mode` tag, so the
//! engine never checks for field presence at runtime.
//!
//! ```json
//! {
//!   "mode": "basic",
//!   "mqtt": { "host": "127.0.0.1", "port": 1883, "topic": "telemetry" },
//!   "device_start_number": 1,
//!   "device_end_number": 3,
//!   "send_interval": 1,
//!   "data": { "format": "default", "data_point_count": 10 },
//!   "custom_keys": []
//! }
//! ```

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fallback prefix used when a scope does not declare one.
pub const DEFAULT_PREFIX: &str = "device";

/// Zero-padding width applied to device indices in identities.
pub const DEFAULT_INDEX_WIDTH: usize = 2;

/// Longest publish interval a config may declare.
pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

/// MQTT QoS level used for telemetry publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Default for Qos {
    fn default() -> Self {
        Self::AtLeastOnce
    }
}

/// Broker connection settings shared by every device of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Broker host name or address.
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Topic every device publishes to.
    pub topic: String,

    /// QoS for telemetry publishes.
    #[serde(default)]
    pub qos: Qos,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Clean session flag.
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,

    /// Connection timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connect_timeout_secs: u64,

    /// Delay before the client retries a dropped connection, in milliseconds.
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period_ms: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_reconnect_period() -> u64 {
    5000
}

impl MqttSettings {
    /// Create settings for a broker and topic with default options.
    pub fn new(host: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            topic: topic.into(),
            qos: Qos::default(),
            keep_alive_secs: default_keep_alive(),
            clean_session: default_clean_session(),
            connect_timeout_secs: default_connection_timeout(),
            reconnect_period_ms: default_reconnect_period(),
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the QoS.
    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    /// Get the full broker address.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms)
    }
}

/// Scalar type of a generated or custom field.
///
/// Closed set: a config naming any other type fails to deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Float,
    Int,
    String,
    Bool,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Float => "float",
            FieldType::Int => "int",
            FieldType::String => "string",
            FieldType::Bool => "bool",
        }
    }
}

/// A user-declared field merged into every payload of its scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomKeyDef {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Lower bound for int/float values (default 0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Upper bound for int/float values (default 100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Static value for string keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl CustomKeyDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            min: None,
            max: None,
            value: None,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Declared bounds with the 0..100 defaults applied.
    pub fn bounds(&self) -> (f64, f64) {
        (self.min.unwrap_or(0.0), self.max.unwrap_or(100.0))
    }
}

/// Relative weights of each field type in a generated schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeRatio {
    #[serde(default)]
    pub float: f64,
    #[serde(default)]
    pub int: f64,
    #[serde(default)]
    pub string: f64,
    #[serde(default)]
    pub bool: f64,
}

impl TypeRatio {
    pub fn new(float: f64, int: f64, string: f64, bool: f64) -> Self {
        Self {
            float,
            int,
            string,
            bool,
        }
    }

    fn weights(&self) -> [(&'static str, f64); 4] {
        [
            ("float", self.float),
            ("int", self.int),
            ("string", self.string),
            ("bool", self.bool),
        ]
    }
}

/// Payload shape for basic mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataFormat {
    /// Flat map of battery telemetry, padded or truncated to the point count.
    Default,
    /// Tag-array envelope.
    Tn,
    /// Envelope with an empty `data` object.
    TnEmpty,
}

impl Default for DataFormat {
    fn default() -> Self {
        Self::Default
    }
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Default => "default",
            DataFormat::Tn => "tn",
            DataFormat::TnEmpty => "tn-empty",
        }
    }
}

/// Basic-mode payload settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    #[serde(default)]
    pub format: DataFormat,
    /// Total number of data points per message, custom keys included.
    pub data_point_count: usize,
}

/// Credential prefixes of one scope, resolved with the fallback chain
/// `client_id -> username -> "device"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialPrefixes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_prefix: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl CredentialPrefixes {
    pub fn device(&self) -> &str {
        non_empty(&self.device_prefix)
            .or_else(|| self.client_id())
            .unwrap_or(DEFAULT_PREFIX)
    }

    fn client_id(&self) -> Option<&str> {
        non_empty(&self.client_id_prefix).or_else(|| non_empty(&self.username_prefix))
    }

    pub fn client_id_or_default(&self) -> &str {
        self.client_id().unwrap_or(DEFAULT_PREFIX)
    }

    pub fn username(&self) -> &str {
        non_empty(&self.username_prefix).unwrap_or(DEFAULT_PREFIX)
    }

    pub fn password(&self) -> &str {
        non_empty(&self.password_prefix).unwrap_or(DEFAULT_PREFIX)
    }
}

/// Flat device range publishing one payload format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicConfig {
    pub device_start_number: u32,
    pub device_end_number: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_prefix: Option<String>,

    /// Seconds between publishes.
    #[serde(default = "default_send_interval")]
    pub send_interval: f64,

    pub data: DataSettings,

    #[serde(default)]
    pub custom_keys: Vec<CustomKeyDef>,
}

fn default_send_interval() -> f64 {
    1.0
}

impl BasicConfig {
    pub fn new(start: u32, end: u32, data_point_count: usize) -> Self {
        Self {
            device_start_number: start,
            device_end_number: end,
            device_prefix: None,
            client_id_prefix: None,
            username_prefix: None,
            password_prefix: None,
            send_interval: default_send_interval(),
            data: DataSettings {
                format: DataFormat::Default,
                data_point_count,
            },
            custom_keys: Vec::new(),
        }
    }

    pub fn range(&self) -> RangeInclusive<u32> {
        self.device_start_number..=self.device_end_number
    }

    pub fn device_count(&self) -> usize {
        range_len(self.device_start_number, self.device_end_number)
    }

    pub fn prefixes(&self) -> CredentialPrefixes {
        CredentialPrefixes {
            device_prefix: self.device_prefix.clone(),
            client_id_prefix: self.client_id_prefix.clone(),
            username_prefix: self.username_prefix.clone(),
            password_prefix: self.password_prefix.clone(),
        }
    }

    /// Generated fields per message once custom keys are accounted for.
    pub fn random_key_count(&self) -> usize {
        self.data
            .data_point_count
            .saturating_sub(self.custom_keys.len())
    }

    pub fn interval(&self) -> Duration {
        interval_duration(self.send_interval)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let scope = "basic";
        check_range(scope, self.device_start_number, self.device_end_number)?;
        check_interval(scope, "send_interval", self.send_interval)?;
        check_custom_keys(scope, &self.custom_keys, self.data.data_point_count)
    }
}

/// An independently configured cohort of devices in advanced mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub start: u32,
    pub end: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_prefix: Option<String>,

    /// Total fields in a full report, custom keys included.
    pub key_count: usize,

    #[serde(default)]
    pub type_ratio: TypeRatio,

    /// Seconds between full reports.
    pub full_interval: f64,

    /// Seconds between change reports.
    #[serde(default = "default_send_interval")]
    pub change_interval: f64,

    /// Fraction of `key_count` sent in a change report.
    #[serde(default)]
    pub change_ratio: f64,

    #[serde(default)]
    pub custom_keys: Vec<CustomKeyDef>,
}

impl GroupConfig {
    pub fn new(name: impl Into<String>, start: u32, end: u32, key_count: usize) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            device_prefix: None,
            client_id_prefix: None,
            username_prefix: None,
            password_prefix: None,
            key_count,
            type_ratio: TypeRatio::default(),
            full_interval: 1.0,
            change_interval: 1.0,
            change_ratio: 0.0,
            custom_keys: Vec::new(),
        }
    }

    pub fn range(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }

    pub fn device_count(&self) -> usize {
        range_len(self.start, self.end)
    }

    pub fn prefixes(&self) -> CredentialPrefixes {
        CredentialPrefixes {
            device_prefix: self.device_prefix.clone(),
            client_id_prefix: self.client_id_prefix.clone(),
            username_prefix: self.username_prefix.clone(),
            password_prefix: self.password_prefix.clone(),
        }
    }

    /// Generated fields in a full report.
    pub fn full_random_count(&self) -> usize {
        self.key_count.saturating_sub(self.custom_keys.len())
    }

    /// Total fields in a change report before custom keys are subtracted.
    pub fn change_total_count(&self) -> usize {
        (self.key_count as f64 * self.change_ratio).floor() as usize
    }

    /// Generated fields in a change report, clamped at zero.
    pub fn change_random_count(&self) -> usize {
        self.change_total_count()
            .saturating_sub(self.custom_keys.len())
    }

    /// Whether this group arms a change-report timer at all.
    pub fn has_change_report(&self) -> bool {
        self.change_total_count() > 0
    }

    pub fn full_period(&self) -> Duration {
        interval_duration(self.full_interval)
    }

    pub fn change_period(&self) -> Duration {
        interval_duration(self.change_interval)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyGroupName);
        }
        let scope = self.name.as_str();
        check_range(scope, self.start, self.end)?;
        check_interval(scope, "full_interval", self.full_interval)?;
        if !(0.0..=1.0).contains(&self.change_ratio) {
            return Err(ConfigError::InvalidRatio {
                scope: scope.to_string(),
                field: "change_ratio",
                value: self.change_ratio,
            });
        }
        if self.has_change_report() {
            check_interval(scope, "change_interval", self.change_interval)?;
        }
        for (field, value) in self.type_ratio.weights() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    scope: scope.to_string(),
                    field,
                    value,
                });
            }
        }
        check_custom_keys(scope, &self.custom_keys, self.key_count)
    }
}

/// Advanced-mode settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedConfig {
    pub groups: Vec<GroupConfig>,
}

/// How the engine addresses devices for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SimulationMode {
    Basic(BasicConfig),
    Advanced(AdvancedConfig),
}

/// Whether sessions publish cached payload templates or fresh values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplatePolicy {
    /// Cached in worker partitions, fresh in-process.
    #[default]
    Auto,
    Fresh,
    Cached,
}

/// The immutable input to one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub mqtt: MqttSettings,

    #[serde(default)]
    pub template_policy: TemplatePolicy,

    #[serde(flatten)]
    pub mode: SimulationMode,
}

impl SimulationConfig {
    pub fn basic(mqtt: MqttSettings, basic: BasicConfig) -> Self {
        Self {
            mqtt,
            template_policy: TemplatePolicy::Auto,
            mode: SimulationMode::Basic(basic),
        }
    }

    pub fn advanced(mqtt: MqttSettings, groups: Vec<GroupConfig>) -> Self {
        Self {
            mqtt,
            template_policy: TemplatePolicy::Auto,
            mode: SimulationMode::Advanced(AdvancedConfig { groups }),
        }
    }

    /// Parse a config from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Total number of simulated devices across all scopes.
    pub fn device_count(&self) -> usize {
        match &self.mode {
            SimulationMode::Basic(basic) => basic.device_count(),
            SimulationMode::Advanced(advanced) => {
                advanced.groups.iter().map(GroupConfig::device_count).sum()
            }
        }
    }

    /// Reject configs that must not start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }

        match &self.mode {
            SimulationMode::Basic(basic) => basic.validate(),
            SimulationMode::Advanced(advanced) => {
                if advanced.groups.is_empty() {
                    return Err(ConfigError::NoGroups);
                }
                let mut names = HashSet::new();
                for group in &advanced.groups {
                    group.validate()?;
                    if !names.insert(group.name.as_str()) {
                        return Err(ConfigError::DuplicateGroup(group.name.clone()));
                    }
                }
                Ok(())
            }
        }
    }
}

fn range_len(start: u32, end: u32) -> usize {
    if end < start {
        0
    } else {
        (end - start) as usize + 1
    }
}

fn check_range(scope: &str, start: u32, end: u32) -> Result<(), ConfigError> {
    if end < start {
        return Err(ConfigError::EmptyRange {
            scope: scope.to_string(),
            start,
            end,
        });
    }
    Ok(())
}

/// Convert interval seconds, clamping to `(0, MAX_INTERVAL]`.
fn interval_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds)
        .unwrap_or(MAX_INTERVAL)
        .clamp(Duration::from_millis(1), MAX_INTERVAL)
}

fn check_interval(scope: &str, field: &'static str, value: f64) -> Result<(), ConfigError> {
    let in_range = Duration::try_from_secs_f64(value)
        .map(|d| !d.is_zero() && d <= MAX_INTERVAL)
        .unwrap_or(false);
    if !in_range {
        return Err(ConfigError::InvalidInterval {
            scope: scope.to_string(),
            field,
            value,
        });
    }
    Ok(())
}

fn check_custom_keys(
    scope: &str,
    custom_keys: &[CustomKeyDef],
    total: usize,
) -> Result<(), ConfigError> {
    if !custom_keys.is_empty() && custom_keys.len() >= total {
        return Err(ConfigError::TooManyCustomKeys {
            scope: scope.to_string(),
            custom: custom_keys.len(),
            total,
        });
    }

    let mut seen = HashSet::new();
    for key in custom_keys {
        if key.name.trim().is_empty() {
            return Err(ConfigError::EmptyCustomKeyName {
                scope: scope.to_string(),
            });
        }
        if !seen.insert(key.name.as_str()) {
            return Err(ConfigError::DuplicateCustomKey {
                scope: scope.to_string(),
                name: key.name.clone(),
            });
        }
        if matches!(key.field_type, FieldType::Int | FieldType::Float) {
            let (min, max) = key.bounds();
            if !min.is_finite() || !max.is_finite() || min > max {
                return Err(ConfigError::InvalidBounds {
                    scope: scope.to_string(),
                    name: key.name.clone(),
                    min,
                    max,
                });
            }
            if key.field_type == FieldType::Int && min.ceil() > max.floor() {
                return Err(ConfigError::InvalidBounds {
                    scope: scope.to_string(),
                    name: key.name.clone(),
                    min,
                    max,
                });
            }
        }
    }
    Ok(())
}

/// Engine tunables that are not part of a run's config.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Basic-mode device count at which worker partitions take over.
    pub worker_threshold: usize,
    /// Maximum devices handled by one worker partition.
    pub per_worker_cap: usize,
    /// Worker budget; `None` means available cores minus one.
    pub core_budget: Option<usize>,
    /// Time a worker gets to stop gracefully before it is terminated.
    pub worker_grace: Duration,
    /// Connect timeout for devices inside worker partitions.
    pub worker_connect_timeout: Duration,
    /// Statistics coalescing window.
    pub stats_window: Duration,
    /// Template cache capacity.
    pub template_capacity: usize,
    /// Log every Nth successful publish per device.
    pub log_sample_every: u64,
    /// Upper bound of the random delay before a worker device's first publish.
    pub max_stagger: Duration,
    /// Scheduling lateness that triggers a drift warning.
    pub drift_threshold: Duration,
    /// Warn on every Nth drifted tick per device.
    pub drift_log_every: u64,
    /// Worker stats batch: successes before a delta is sent upstream.
    pub stats_batch_success: u64,
    /// Worker stats batch: failures before a delta is sent upstream.
    pub stats_batch_failure: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_threshold: 500,
            per_worker_cap: 250,
            core_budget: None,
            worker_grace: Duration::from_millis(500),
            worker_connect_timeout: Duration::from_secs(4),
            stats_window: Duration::from_secs(1),
            template_capacity: 100,
            log_sample_every: 10,
            max_stagger: Duration::from_millis(1000),
            drift_threshold: Duration::from_millis(100),
            drift_log_every: 50,
            stats_batch_success: 100,
            stats_batch_failure: 10,
        }
    }
}

impl EngineSettings {
    /// Default settings with environment overrides applied.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(v) = env_vars::parse(env_vars::WORKER_THRESHOLD) {
            settings.worker_threshold = v;
        }
        if let Some(v) = env_vars::parse(env_vars::PER_WORKER_CAP) {
            settings.per_worker_cap = v;
        }
        if let Some(v) = env_vars::parse(env_vars::CORE_BUDGET) {
            settings.core_budget = Some(v);
        }
        settings
    }

    /// Workers available to a run.
    pub fn effective_core_budget(&self) -> usize {
        self.core_budget
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get().saturating_sub(1))
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// Environment variable names for engine overrides.
pub mod env_vars {
    pub const WORKER_THRESHOLD: &str = "FLEETSIM_WORKER_THRESHOLD";
    pub const PER_WORKER_CAP: &str = "FLEETSIM_PER_WORKER_CAP";
    pub const CORE_BUDGET: &str = "FLEETSIM_CORE_BUDGET";
    pub const LOG_JSON: &str = "FLEETSIM_LOG_JSON";

    pub(crate) fn parse(name: &str) -> Option<usize> {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|v: &usize| *v > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt() -> MqttSettings {
        MqttSettings::new("localhost", "telemetry")
    }

    #[test]
    fn test_parse_basic_config() {
        let json = r#"{
            "mode": "basic",
            "mqtt": { "host": "127.0.0.1", "topic": "t/1" },
            "device_start_number": 1,
            "device_end_number": 3,
            "send_interval": 1,
            "data": { "format": "tn-empty", "data_point_count": 10 },
            "custom_keys": [{ "name": "site", "type": "string", "value": "A" }]
        }"#;

        let config = SimulationConfig::from_json(json).unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.qos, Qos::AtLeastOnce);
        assert_eq!(config.template_policy, TemplatePolicy::Auto);
        assert_eq!(config.device_count(), 3);

        match config.mode {
            SimulationMode::Basic(basic) => {
                assert_eq!(basic.data.format, DataFormat::TnEmpty);
                assert_eq!(basic.random_key_count(), 9);
                assert_eq!(basic.custom_keys[0].value.as_deref(), Some("A"));
            }
            SimulationMode::Advanced(_) => panic!("expected basic mode"),
        }
    }

    #[test]
    fn test_parse_advanced_config() {
        let json = r#"{
            "mode": "advanced",
            "mqtt": { "host": "broker", "port": 1884, "topic": "t" },
            "groups": [{
                "name": "meters",
                "start": 1, "end": 10,
                "client_id_prefix": "meter_",
                "key_count": 20,
                "type_ratio": { "float": 0.5, "int": 0.5 },
                "full_interval": 10,
                "change_interval": 2,
                "change_ratio": 0.3
            }]
        }"#;

        let config = SimulationConfig::from_json(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.device_count(), 10);
        let SimulationMode::Advanced(advanced) = &config.mode else {
            panic!("expected advanced mode");
        };
        let group = &advanced.groups[0];
        assert_eq!(group.change_total_count(), 6);
        assert!(group.has_change_report());
        assert_eq!(group.prefixes().client_id_or_default(), "meter_");
        assert_eq!(group.prefixes().username(), DEFAULT_PREFIX);
    }

    #[test]
    fn test_unknown_field_type_rejected() {
        let json = r#"{ "name": "k", "type": "decimal" }"#;
        assert!(serde_json::from_str::<CustomKeyDef>(json).is_err());
    }

    #[test]
    fn test_custom_keys_must_be_fewer_than_total() {
        let mut basic = BasicConfig::new(1, 3, 5);
        basic.custom_keys = (0..5)
            .map(|i| CustomKeyDef::new(format!("c{}", i), FieldType::Int))
            .collect();
        let config = SimulationConfig::basic(mqtt(), basic);

        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyCustomKeys {
                scope: "basic".to_string(),
                custom: 5,
                total: 5,
            })
        );
    }

    #[test]
    fn test_group_validation() {
        let mut group = GroupConfig::new("g", 5, 1, 10);
        let config = SimulationConfig::advanced(mqtt(), vec![group.clone()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyRange { .. })
        ));

        group.end = 9;
        group.change_ratio = 1.5;
        let config = SimulationConfig::advanced(mqtt(), vec![group.clone()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRatio { .. })
        ));

        group.change_ratio = 0.5;
        let config = SimulationConfig::advanced(mqtt(), vec![group.clone(), group]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateGroup("g".to_string()))
        );

        let config = SimulationConfig::advanced(mqtt(), Vec::new());
        assert_eq!(config.validate(), Err(ConfigError::NoGroups));
    }

    #[test]
    fn test_change_quota_is_clamped() {
        let mut group = GroupConfig::new("g", 1, 1, 10);
        group.change_ratio = 0.2;
        group.custom_keys = (0..4)
            .map(|i| CustomKeyDef::new(format!("c{}", i), FieldType::Bool))
            .collect();

        assert_eq!(group.change_total_count(), 2);
        assert_eq!(group.change_random_count(), 0);
        assert_eq!(group.full_random_count(), 6);
    }

    #[test]
    fn test_prefix_fallbacks() {
        let prefixes = CredentialPrefixes {
            username_prefix: Some("user_".to_string()),
            ..Default::default()
        };
        assert_eq!(prefixes.client_id_or_default(), "user_");
        assert_eq!(prefixes.username(), "user_");
        assert_eq!(prefixes.password(), DEFAULT_PREFIX);
    }

    #[test]
    fn test_oversized_interval_rejected() {
        for value in [1e20, f64::NAN, 0.0, -1.0, 86_401.0] {
            let mut basic = BasicConfig::new(1, 1, 5);
            basic.send_interval = value;
            let config = SimulationConfig::basic(mqtt(), basic);
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidInterval {
                    field: "send_interval",
                    ..
                })
            ));
        }

        let mut group = GroupConfig::new("g", 1, 1, 10);
        group.full_interval = 1e20;
        let config = SimulationConfig::advanced(mqtt(), vec![group.clone()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInterval {
                field: "full_interval",
                ..
            })
        ));
        assert_eq!(group.full_period(), MAX_INTERVAL);
    }

    #[test]
    fn test_bounds_validation() {
        let mut basic = BasicConfig::new(1, 1, 10);
        basic.custom_keys = vec![CustomKeyDef::new("t", FieldType::Float).with_range(10.0, 1.0)];
        let config = SimulationConfig::basic(mqtt(), basic);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn test_engine_defaults() {
        let settings = EngineSettings {
            core_budget: Some(0),
            ..Default::default()
        };
        assert_eq!(settings.worker_threshold, 500);
        assert_eq!(settings.per_worker_cap, 250);
        assert_eq!(settings.effective_core_budget(), 1);
    }
}
