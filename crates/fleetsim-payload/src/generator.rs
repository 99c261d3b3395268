//! Telemetry payload generators.
//!
//! Every generator returns a JSON object whose key order is the generation
//! order. Values are random; shapes are not.

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Map, Number, Value};

use fleetsim_core::{CustomKeyDef, DataFormat, FieldType};

use crate::schema::SchemaField;

/// A JSON object payload.
pub type Payload = Map<String, Value>;

/// Serial number carried by the tag envelope.
pub const TN_SERIAL: &str = "TN001";

/// Channel key of the tag array in the tag envelope.
pub const TN_CHANNEL: &str = "C24_D1";

/// Number of fixed fields in the default battery payload.
pub const BATTERY_BASE_FIELDS: usize = 10;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn random_float<R: Rng>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max <= min {
        return round2(min);
    }
    round2(rng.gen_range(min..=max)).clamp(min, max)
}

fn random_int<R: Rng>(rng: &mut R, min: i64, max: i64) -> i64 {
    if max <= min {
        return min;
    }
    rng.gen_range(min..=max)
}

/// Random value for a schema field of `field_type`.
pub fn typed_value<R: Rng>(rng: &mut R, field_type: FieldType) -> Value {
    match field_type {
        FieldType::Float => float_value(random_float(rng, 0.0, 100.0)),
        FieldType::Int => Value::from(random_int(rng, 0, 1000)),
        FieldType::String => Value::from(format!("str_val_{}", random_int(rng, 0, 100))),
        FieldType::Bool => Value::from(rng.gen_bool(0.5)),
    }
}

/// Values for the first `min(count, schema.len())` schema fields.
///
/// Two calls with different counts against the same schema produce key
/// sequences where the shorter is a prefix of the longer.
pub fn generate_typed_data<R: Rng>(
    rng: &mut R,
    schema: &[SchemaField],
    count: usize,
) -> Payload {
    let mut data = Map::with_capacity(count.min(schema.len()));
    for field in schema.iter().take(count) {
        data.insert(field.name.clone(), typed_value(rng, field.field_type));
    }
    data
}

/// Battery telemetry, truncated or padded with `random_key_N` to `count` keys.
pub fn generate_battery_status<R: Rng>(rng: &mut R, count: usize) -> Payload {
    let base = [
        ("wind1", json!(0)),
        ("wind3", json!(0)),
        ("power", json!(format!("{:.2}", random_float(rng, 0.0, 100.0)))),
        ("capacity", json!(format!("{}Ah", random_int(rng, 50, 200)))),
        ("charge_level", json!(format!("{}%", random_int(rng, 0, 100)))),
        (
            "health_status",
            json!(if rng.gen_bool(0.5) { "Good" } else { "Poor" }),
        ),
        ("temperature", json!(format!("{}C", random_int(rng, -20, 45)))),
        ("cycle_count", json!(random_int(rng, 0, 500))),
        ("remaining_life", json!(format!("{}%", random_int(rng, 0, 100)))),
        ("charge_rate", json!(format!("{:.2}A", random_float(rng, 0.0, 5.0)))),
    ];

    let mut data = Map::with_capacity(count);
    for (key, value) in base.into_iter().take(count) {
        data.insert(key.to_string(), value);
    }
    for i in (BATTERY_BASE_FIELDS + 1)..=count {
        data.insert(format!("random_key_{}", i), Value::from(random_int(rng, 0, 1000)));
    }
    data
}

fn tn_envelope(data: Value) -> Payload {
    let now = Utc::now();
    let mut envelope = Map::with_capacity(5);
    envelope.insert("type".into(), Value::from("real"));
    envelope.insert("sn".into(), Value::from(TN_SERIAL));
    envelope.insert(
        "sendStartTime".into(),
        Value::from(now.format("%Y-%m-%d %H:%M:%S").to_string()),
    );
    envelope.insert("time".into(), Value::from(now.timestamp_millis()));
    envelope.insert("data".into(), data);
    envelope
}

/// Tag envelope carrying `count` tags.
pub fn generate_tn_payload<R: Rng>(rng: &mut R, count: usize) -> Payload {
    let tags: Vec<Value> = (1..=count)
        .map(|i| {
            json!({
                "id": format!("Tag{}", i),
                "desc": format!("C1_D1_Tag{}", i),
                "quality": 0,
                "value": rng.gen::<f64>(),
            })
        })
        .collect();

    let mut data = Map::with_capacity(1);
    data.insert(TN_CHANNEL.to_string(), Value::Array(tags));
    tn_envelope(Value::Object(data))
}

/// Tag envelope with an empty `data` object.
pub fn generate_tn_empty_payload() -> Payload {
    tn_envelope(Value::Object(Map::new()))
}

/// Payload of a basic-mode format.
pub fn generate_format<R: Rng>(rng: &mut R, format: DataFormat, count: usize) -> Payload {
    match format {
        DataFormat::Default => generate_battery_status(rng, count),
        DataFormat::Tn => generate_tn_payload(rng, count),
        DataFormat::TnEmpty => generate_tn_empty_payload(),
    }
}

/// Value for one custom key.
pub fn custom_key_value<R: Rng>(rng: &mut R, key: &CustomKeyDef) -> Value {
    match key.field_type {
        FieldType::Int => {
            let (min, max) = key.bounds();
            Value::from(random_int(rng, min.ceil() as i64, max.floor() as i64))
        }
        FieldType::Float => {
            let (min, max) = key.bounds();
            float_value(random_float(rng, min, max))
        }
        FieldType::String => match key.value.as_deref().filter(|v| !v.is_empty()) {
            Some(value) => Value::from(value),
            None => Value::from(format!("str_{}", random_int(rng, 0, 1000))),
        },
        FieldType::Bool => Value::from(rng.gen_bool(0.5)),
    }
}

/// Values for every named custom key, in declaration order.
pub fn generate_custom_keys<R: Rng>(rng: &mut R, keys: &[CustomKeyDef]) -> Payload {
    let mut data = Map::with_capacity(keys.len());
    for key in keys.iter().filter(|k| !k.name.is_empty()) {
        data.insert(key.name.clone(), custom_key_value(rng, key));
    }
    data
}

/// New payload with the custom keys first, then the generated fields.
///
/// Custom keys win on a name clash: the generated field of the same name is
/// dropped. `generated` is left untouched.
pub fn merge_custom_keys<R: Rng>(
    rng: &mut R,
    generated: &Payload,
    keys: &[CustomKeyDef],
) -> Payload {
    let mut merged = generate_custom_keys(rng, keys);
    for (key, value) in generated {
        if !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
