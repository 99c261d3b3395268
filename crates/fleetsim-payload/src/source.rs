//! Per-session payload sources.
//!
//! A [`PayloadPlan`] describes what one report publishes (its shape, its
//! custom keys and whether templates are cached). It is shared by every
//! device of a cohort; each session turns it into its own
//! [`PayloadSource`], which owns the random state.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use fleetsim_core::{BasicConfig, CustomKeyDef, DataFormat, GroupConfig, Result};

use crate::generator::{generate_format, generate_typed_data, merge_custom_keys, Payload};
use crate::schema::Schema;
use crate::template_cache::TemplateCache;

/// Shape of the generated part of a payload.
#[derive(Debug, Clone)]
pub enum PayloadShape {
    /// A fixed basic-mode format with `count` generated points.
    Format { format: DataFormat, count: usize },
    /// The first `count` fields of a group schema.
    Typed { schema: Arc<Schema>, count: usize },
}

/// Everything a session needs to render one kind of report.
#[derive(Clone)]
pub struct PayloadPlan {
    shape: PayloadShape,
    custom_keys: Arc<[CustomKeyDef]>,
    cache: Option<Arc<TemplateCache>>,
}

impl PayloadPlan {
    pub fn new(shape: PayloadShape, custom_keys: Arc<[CustomKeyDef]>) -> Self {
        Self {
            shape,
            custom_keys,
            cache: None,
        }
    }

    /// Basic-mode plan: `data_point_count - custom keys` generated points.
    pub fn basic(config: &BasicConfig) -> Self {
        Self::new(
            PayloadShape::Format {
                format: config.data.format,
                count: config.random_key_count(),
            },
            Arc::from(config.custom_keys.as_slice()),
        )
    }

    /// Full report of a group.
    pub fn full_report(group: &GroupConfig, schema: Arc<Schema>) -> Self {
        Self::new(
            PayloadShape::Typed {
                schema,
                count: group.full_random_count(),
            },
            Arc::from(group.custom_keys.as_slice()),
        )
    }

    /// Change report of a group: a prefix of the full field set.
    pub fn change_report(group: &GroupConfig, schema: Arc<Schema>) -> Self {
        Self::new(
            PayloadShape::Typed {
                schema,
                count: group.change_random_count(),
            },
            Arc::from(group.custom_keys.as_slice()),
        )
    }

    /// Publish templates from `cache` instead of fresh values.
    pub fn with_cache(mut self, cache: Arc<TemplateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    pub fn shape(&self) -> &PayloadShape {
        &self.shape
    }

    pub fn custom_keys(&self) -> &[CustomKeyDef] {
        &self.custom_keys
    }

    /// Number of top-level keys a rendered payload carries.
    pub fn generated_count(&self) -> usize {
        match &self.shape {
            PayloadShape::Format { count, .. } => *count,
            PayloadShape::Typed { schema, count } => (*count).min(schema.len()),
        }
    }

    /// A session-owned source seeded from OS entropy.
    pub fn source(&self) -> PayloadSource {
        PayloadSource {
            plan: self.clone(),
            rng: StdRng::from_entropy(),
        }
    }

    /// A source with a fixed seed.
    pub fn seeded_source(&self, seed: u64) -> PayloadSource {
        PayloadSource {
            plan: self.clone(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

/// Renders payloads for one session.
pub struct PayloadSource {
    plan: PayloadPlan,
    rng: StdRng,
}

impl PayloadSource {
    pub fn plan(&self) -> &PayloadPlan {
        &self.plan
    }

    /// A freshly generated payload, custom keys first.
    pub fn sample(&mut self) -> Payload {
        let generated = match &self.plan.shape {
            PayloadShape::Format { format, count } => generate_format(&mut self.rng, *format, *count),
            PayloadShape::Typed { schema, count } => {
                generate_typed_data(&mut self.rng, schema.fields(), *count)
            }
        };
        if self.plan.custom_keys.is_empty() {
            generated
        } else {
            merge_custom_keys(&mut self.rng, &generated, &self.plan.custom_keys)
        }
    }

    /// The serialized payload for the next publish.
    pub fn next_payload(&mut self) -> Result<Arc<str>> {
        match &self.plan.cache {
            Some(cache) => match &self.plan.shape {
                PayloadShape::Format { format, count } => {
                    cache.basic_template(*format, *count, &self.plan.custom_keys)
                }
                PayloadShape::Typed { schema, count } => {
                    cache.get_or_create(schema, *count, &self.plan.custom_keys)
                }
            },
            None => {
                let payload = self.sample();
                Ok(Arc::from(serde_json::to_string(&payload)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaGenerator;
    use fleetsim_core::{FieldType, TypeRatio};

    fn keys_of(text: &str) -> Vec<String> {
        let value: serde_json::Value = serde_json::from_str(text).unwrap();
        value.as_object().unwrap().keys().cloned().collect()
    }

    #[test]
    fn test_basic_plan_has_data_point_count_keys() {
        let mut config = BasicConfig::new(1, 3, 10);
        config.custom_keys = vec![CustomKeyDef::new("site", FieldType::String).with_value("a")];
        let plan = PayloadPlan::basic(&config);
        assert_eq!(plan.generated_count(), 9);

        let mut source = plan.seeded_source(1);
        let keys = keys_of(&source.next_payload().unwrap());
        assert_eq!(keys.len(), 10);
        assert_eq!(keys[0], "site");
    }

    #[test]
    fn test_change_report_is_prefix_of_full_report() {
        let mut group = GroupConfig::new("g", 1, 2, 10);
        group.type_ratio = TypeRatio::new(0.5, 0.5, 0.0, 0.0);
        group.change_ratio = 0.4;
        group.custom_keys = vec![CustomKeyDef::new("c", FieldType::Bool)];
        let schema = Arc::new(SchemaGenerator::generate(group.key_count, &group.type_ratio));

        let full = keys_of(
            &PayloadPlan::full_report(&group, schema.clone())
                .seeded_source(2)
                .next_payload()
                .unwrap(),
        );
        let change = keys_of(
            &PayloadPlan::change_report(&group, schema)
                .seeded_source(3)
                .next_payload()
                .unwrap(),
        );

        assert_eq!(full.len(), 10);
        assert_eq!(change.len(), 4);
        assert_eq!(&full[..4], &change[..]);
    }

    #[test]
    fn test_cached_plan_reuses_template() {
        let cache = Arc::new(TemplateCache::new());
        let plan = PayloadPlan::basic(&BasicConfig::new(1, 1, 12)).with_cache(cache.clone());
        assert!(plan.is_cached());

        let mut a = plan.source();
        let mut b = plan.source();
        let first = a.next_payload().unwrap();
        let second = b.next_payload().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fresh_plan_does_not_touch_cache() {
        let plan = PayloadPlan::basic(&BasicConfig::new(1, 1, 12));
        let mut source = plan.seeded_source(9);
        let first = source.next_payload().unwrap();
        let second = source.next_payload().unwrap();
        assert_eq!(keys_of(&first), keys_of(&second));
    }
}
