//! Device cohorts: a device range plus the reports its devices publish.
//!
//! A basic run is one cohort with a single report. Each advanced-mode group
//! is a cohort with a full report and, when its change quota is non-zero, a
//! change report drawn from the same schema.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use fleetsim_core::{
    BasicConfig, CredentialPrefixes, GroupConfig, SimulationConfig, SimulationMode, TemplatePolicy,
};
use fleetsim_payload::{PayloadPlan, SchemaGenerator, TemplateCache};

/// Which cadence a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Basic,
    Full,
    Change,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Basic => "basic",
            ReportKind::Full => "full",
            ReportKind::Change => "change",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recurring publish of a device.
#[derive(Clone)]
pub struct ReportSpec {
    pub kind: ReportKind,
    pub period: Duration,
    pub plan: PayloadPlan,
}

/// Devices sharing prefixes, schema and cadence.
#[derive(Clone)]
pub struct Cohort {
    /// `"basic"` or the group name.
    pub label: String,
    /// Group name for per-group message sizes; `None` in basic mode.
    pub group: Option<Arc<str>>,
    pub range: RangeInclusive<u32>,
    pub prefixes: CredentialPrefixes,
    pub reports: Vec<ReportSpec>,
    /// Set once the cohort's sample payload has been logged.
    pub preview_logged: Arc<AtomicBool>,
}

impl Cohort {
    pub fn basic(config: &BasicConfig, cache: Option<Arc<TemplateCache>>) -> Self {
        let mut plan = PayloadPlan::basic(config);
        if let Some(cache) = cache {
            plan = plan.with_cache(cache);
        }
        Self {
            label: "basic".to_string(),
            group: None,
            range: config.range(),
            prefixes: config.prefixes(),
            reports: vec![ReportSpec {
                kind: ReportKind::Basic,
                period: config.interval(),
                plan,
            }],
            preview_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn group(config: &GroupConfig, cache: Option<Arc<TemplateCache>>) -> Self {
        let schema = Arc::new(SchemaGenerator::generate(config.key_count, &config.type_ratio));
        let with_cache = |plan: PayloadPlan| match &cache {
            Some(cache) => plan.with_cache(cache.clone()),
            None => plan,
        };

        let mut reports = vec![ReportSpec {
            kind: ReportKind::Full,
            period: config.full_period(),
            plan: with_cache(PayloadPlan::full_report(config, schema.clone())),
        }];
        if config.has_change_report() {
            reports.push(ReportSpec {
                kind: ReportKind::Change,
                period: config.change_period(),
                plan: with_cache(PayloadPlan::change_report(config, schema)),
            });
        }

        Self {
            label: config.name.clone(),
            group: Some(Arc::from(config.name.as_str())),
            range: config.range(),
            prefixes: config.prefixes(),
            reports,
            preview_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn device_count(&self) -> usize {
        self.range.clone().count()
    }
}

/// Whether sessions should publish cached templates.
pub fn use_template_cache(policy: TemplatePolicy, in_worker: bool) -> bool {
    match policy {
        TemplatePolicy::Auto => in_worker,
        TemplatePolicy::Cached => true,
        TemplatePolicy::Fresh => false,
    }
}

/// Every cohort of a config, for in-process sessions.
pub fn cohorts(config: &SimulationConfig, cache: &Arc<TemplateCache>) -> Vec<Cohort> {
    let cache = use_template_cache(config.template_policy, false).then(|| cache.clone());
    match &config.mode {
        SimulationMode::Basic(basic) => vec![Cohort::basic(basic, cache)],
        SimulationMode::Advanced(advanced) => advanced
            .groups
            .iter()
            .map(|group| Cohort::group(group, cache.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsim_core::{MqttSettings, TypeRatio};

    #[test]
    fn test_group_without_change_quota_has_one_report() {
        let mut group = GroupConfig::new("g", 1, 5, 10);
        group.change_ratio = 0.05;
        let cohort = Cohort::group(&group, None);
        assert_eq!(cohort.reports.len(), 1);
        assert_eq!(cohort.reports[0].kind, ReportKind::Full);
        assert_eq!(cohort.device_count(), 5);

        group.change_ratio = 0.1;
        group.change_interval = 0.5;
        let cohort = Cohort::group(&group, None);
        assert_eq!(cohort.reports.len(), 2);
        assert_eq!(cohort.reports[1].period, Duration::from_millis(500));
    }

    #[test]
    fn test_policy() {
        assert!(use_template_cache(TemplatePolicy::Auto, true));
        assert!(!use_template_cache(TemplatePolicy::Auto, false));
        assert!(use_template_cache(TemplatePolicy::Cached, false));
        assert!(!use_template_cache(TemplatePolicy::Fresh, true));
    }

    #[test]
    fn test_cohorts_follow_mode() {
        let cache = Arc::new(TemplateCache::new());
        let mut a = GroupConfig::new("a", 1, 2, 4);
        a.type_ratio = TypeRatio::new(0.0, 1.0, 0.0, 0.0);
        let b = GroupConfig::new("b", 3, 4, 4);
        let config = SimulationConfig::advanced(MqttSettings::new("h", "t"), vec![a, b]);

        let cohorts = cohorts(&config, &cache);
        assert_eq!(cohorts.len(), 2);
        assert_eq!(cohorts[1].label, "b");
        assert_eq!(cohorts[0].group.as_deref(), Some("a"));
        assert!(!cohorts[0].reports[0].plan.is_cached());
    }
}
