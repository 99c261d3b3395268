//! Memoized, serialized payload templates.
//!
//! A template is a payload rendered once and then published verbatim by
//! every device sharing the same shape. Entries are evicted oldest-first
//! once the cache reaches capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use fleetsim_core::{CustomKeyDef, DataFormat, Result};

use crate::generator::{generate_format, generate_typed_data, merge_custom_keys, Payload};
use crate::schema::Schema;

/// Default number of templates kept.
pub const DEFAULT_TEMPLATE_CAPACITY: usize = 100;

/// Occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Arc<str>>,
    order: VecDeque<String>,
}

/// Bounded FIFO cache of serialized payloads.
pub struct TemplateCache {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TEMPLATE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity: capacity.max(1),
        }
    }

    /// Template for the first `count` fields of `schema` plus custom keys.
    pub fn get_or_create(
        &self,
        schema: &Schema,
        count: usize,
        custom_keys: &[CustomKeyDef],
    ) -> Result<Arc<str>> {
        let key = format!(
            "{}-{}-{}",
            schema.fingerprint(),
            count,
            custom_fingerprint(custom_keys)?
        );
        self.lookup_or_insert(key, custom_keys, |rng| {
            generate_typed_data(rng, schema.fields(), count)
        })
    }

    /// Template for a basic-mode format.
    pub fn basic_template(
        &self,
        format: DataFormat,
        count: usize,
        custom_keys: &[CustomKeyDef],
    ) -> Result<Arc<str>> {
        let key = format!(
            "basic-{}-{}-{}",
            format.as_str(),
            count,
            custom_fingerprint(custom_keys)?
        );
        self.lookup_or_insert(key, custom_keys, |rng| generate_format(rng, format, count))
    }

    fn lookup_or_insert<F>(
        &self,
        key: String,
        custom_keys: &[CustomKeyDef],
        build: F,
    ) -> Result<Arc<str>>
    where
        F: FnOnce(&mut StdRng) -> Payload,
    {
        if let Some(hit) = self.entries.lock().map.get(&key) {
            return Ok(Arc::clone(hit));
        }

        let mut rng = StdRng::from_entropy();
        let mut payload = build(&mut rng);
        if !custom_keys.is_empty() {
            payload = merge_custom_keys(&mut rng, &payload, custom_keys);
        }
        let template: Arc<str> = Arc::from(serde_json::to_string(&payload)?);

        let mut entries = self.entries.lock();
        // Another session may have rendered the same key meanwhile.
        if let Some(hit) = entries.map.get(&key) {
            return Ok(Arc::clone(hit));
        }
        while entries.map.len() >= self.capacity {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.map.remove(&oldest);
                }
                None => break,
            }
        }
        entries.order.push_back(key.clone());
        entries.map.insert(key, Arc::clone(&template));
        Ok(template)
    }

    /// Drop every template.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        let dropped = entries.map.len();
        entries.map.clear();
        entries.order.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Template cache cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
        }
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new()
    }
}

fn custom_fingerprint(custom_keys: &[CustomKeyDef]) -> Result<String> {
    if custom_keys.is_empty() {
        Ok("empty".to_string())
    } else {
        Ok(serde_json::to_string(custom_keys)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaGenerator;
    use fleetsim_core::{FieldType, TypeRatio};

    fn schema(count: usize) -> Schema {
        SchemaGenerator::generate(count, &TypeRatio::new(1.0, 1.0, 0.0, 0.0))
    }

    #[test]
    fn test_identical_inputs_hit() {
        let cache = TemplateCache::new();
        let schema = schema(10);
        let keys = vec![CustomKeyDef::new("site", FieldType::Int)];

        let a = cache.get_or_create(&schema, 8, &keys).unwrap();
        let b = cache.get_or_create(&schema, 8, &keys).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(cache.len(), 1);

        let value: serde_json::Value = serde_json::from_str(&a).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 9);
    }

    #[test]
    fn test_clear_forgets_entries() {
        let cache = TemplateCache::new();
        let schema = schema(50);
        let before = cache.get_or_create(&schema, 50, &[]).unwrap();
        cache.clear();
        assert!(cache.is_empty());

        let after = cache.get_or_create(&schema, 50, &[]).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let cache = TemplateCache::with_capacity(5);
        let schema = schema(30);
        for count in 0..30 {
            cache.get_or_create(&schema, count, &[]).unwrap();
            assert!(cache.len() <= 5);
        }
        assert_eq!(
            cache.stats(),
            CacheStats {
                size: 5,
                capacity: 5
            }
        );
    }

    #[test]
    fn test_oldest_entry_evicted_first() {
        let cache = TemplateCache::with_capacity(2);
        let schema = schema(4);
        let first = cache.get_or_create(&schema, 1, &[]).unwrap();
        let second = cache.get_or_create(&schema, 2, &[]).unwrap();
        cache.get_or_create(&schema, 3, &[]).unwrap();

        let second_again = cache.get_or_create(&schema, 2, &[]).unwrap();
        assert!(Arc::ptr_eq(&second, &second_again));
        let first_again = cache.get_or_create(&schema, 1, &[]).unwrap();
        assert!(!Arc::ptr_eq(&first, &first_again));
    }

    #[test]
    fn test_basic_templates_are_keyed_by_format() {
        let cache = TemplateCache::new();
        let default = cache.basic_template(DataFormat::Default, 10, &[]).unwrap();
        let tn = cache.basic_template(DataFormat::Tn, 10, &[]).unwrap();
        assert_ne!(default, tn);
        assert_eq!(cache.stats().size, 2);

        let value: serde_json::Value = serde_json::from_str(&default).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 10);
    }
}
