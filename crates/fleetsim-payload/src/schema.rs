//! Schema generation for advanced-mode groups.
//!
//! A schema is the ordered list of field names and types a group publishes.
//! Fields are laid out in blocks (float, int, string, bool) and named with a
//! running index, so the first K entries are the same whatever the total
//! count. Change reports rely on this: they always take a prefix.

use serde::{Deserialize, Serialize};

use fleetsim_core::{FieldType, TypeRatio};

/// One named, typed field of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// Per-type field counts derived from a key count and a type ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeCounts {
    pub float: usize,
    pub int: usize,
    pub string: usize,
    pub bool: usize,
}

impl TypeCounts {
    /// Split `key_count` by `ratio`, assigning the rounding shortfall to float.
    pub fn split(key_count: usize, ratio: &TypeRatio) -> Self {
        let weights = [ratio.float, ratio.int, ratio.string, ratio.bool]
            .map(|w| if w.is_finite() && w > 0.0 { w } else { 0.0 });
        let total: f64 = weights.iter().sum();

        let mut counts = if total <= 0.0 {
            Self {
                float: key_count,
                ..Default::default()
            }
        } else {
            let part = |w: f64| (key_count as f64 * (w / total)).floor() as usize;
            Self {
                float: part(weights[0]),
                int: part(weights[1]),
                string: part(weights[2]),
                bool: part(weights[3]),
            }
        };

        // Floating point can overshoot by one on exact splits.
        while counts.total() > key_count {
            if counts.float > 0 {
                counts.float -= 1;
            } else if counts.int > 0 {
                counts.int -= 1;
            } else if counts.string > 0 {
                counts.string -= 1;
            } else {
                counts.bool -= 1;
            }
        }
        counts.float += key_count - counts.total();
        counts
    }

    pub fn total(&self) -> usize {
        self.float + self.int + self.string + self.bool
    }
}

/// Immutable, ordered field list shared by every device of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<SchemaField>,
    fingerprint: String,
}

impl Schema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        let fingerprint = serde_json::to_string(&fields).unwrap_or_default();
        Self {
            fields,
            fingerprint,
        }
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First `count` fields, clamped to the schema length.
    pub fn prefix(&self, count: usize) -> &[SchemaField] {
        &self.fields[..count.min(self.fields.len())]
    }

    /// Stable serialization used in cache keys.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn counts(&self) -> TypeCounts {
        let mut counts = TypeCounts::default();
        for field in &self.fields {
            match field.field_type {
                FieldType::Float => counts.float += 1,
                FieldType::Int => counts.int += 1,
                FieldType::String => counts.string += 1,
                FieldType::Bool => counts.bool += 1,
            }
        }
        counts
    }
}

/// Builds schemas from a key count and type ratio.
pub struct SchemaGenerator;

impl SchemaGenerator {
    pub fn generate(key_count: usize, ratio: &TypeRatio) -> Schema {
        let counts = TypeCounts::split(key_count, ratio);
        let blocks = [
            (FieldType::Float, "float_key", counts.float),
            (FieldType::Int, "int_key", counts.int),
            (FieldType::String, "str_key", counts.string),
            (FieldType::Bool, "bool_key", counts.bool),
        ];

        let mut fields = Vec::with_capacity(key_count);
        let mut index = 1;
        for (field_type, stem, count) in blocks {
            for _ in 0..count {
                fields.push(SchemaField {
                    name: format!("{}_{}", stem, index),
                    field_type,
                });
                index += 1;
            }
        }
        Schema::new(fields)
    }
}
