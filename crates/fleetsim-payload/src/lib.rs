//! Payload generation for the fleetsim device-fleet simulator.
//!
//! - [`schema`]: stable field lists for advanced-mode groups
//! - [`generator`]: typed, battery and tag-envelope payloads plus custom keys
//! - [`template_cache`]: bounded cache of serialized templates
//! - [`source`]: per-session rendering of a report

pub mod generator;
pub mod schema;
pub mod source;
pub mod template_cache;

pub use generator::{
    custom_key_value, generate_battery_status, generate_custom_keys, generate_format,
    generate_tn_empty_payload, generate_tn_payload, generate_typed_data, merge_custom_keys,
    Payload,
};
pub use schema::{Schema, SchemaField, SchemaGenerator, TypeCounts};
pub use source::{PayloadPlan, PayloadShape, PayloadSource};
pub use template_cache::{CacheStats, TemplateCache, DEFAULT_TEMPLATE_CAPACITY};
