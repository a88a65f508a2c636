//! Experiment, feature flag and assignment definitions.
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::ValidationError, Targeting};

#[allow(missing_docs)]
pub type Timestamp = DateTime<Utc>;

/// Opaque per-variant configuration handed back to the caller.
pub type VariantConfig = serde_json::Map<String, serde_json::Value>;

/// Allowed drift of the variant allocation sum from 100.
pub const ALLOCATION_TOLERANCE: f64 = 0.01;

/// Lifecycle of an experiment. Only running experiments assign variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum ExperimentStatus {
    #[default]
    Draft,
    Running,
    Paused,
    Completed,
}

/// One arm of an experiment (or of a multivariate flag).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentVariant {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub name: String,
    /// Share of the included traffic, 0–100.
    pub allocation: f64,
    #[allow(missing_docs)]
    #[serde(default)]
    pub config: VariantConfig,
    /// The baseline variant. Also used as the fallback when no bucket matches.
    #[serde(default)]
    pub is_control: bool,
}

impl ExperimentVariant {
    /// Create a treatment variant.
    pub fn new(id: impl Into<String>, allocation: f64) -> ExperimentVariant {
        let id = id.into();
        ExperimentVariant {
            name: id.clone(),
            id,
            allocation,
            config: VariantConfig::new(),
            is_control: false,
        }
    }

    /// Create a control variant.
    pub fn control(id: impl Into<String>, allocation: f64) -> ExperimentVariant {
        ExperimentVariant {
            is_control: true,
            ..ExperimentVariant::new(id, allocation)
        }
    }

    #[allow(missing_docs)]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a key to the variant config.
    pub fn with_config(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Definition of an A/B experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentConfig {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub description: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub status: ExperimentStatus,
    /// Variants in declaration order. Order matters for bucketing.
    pub variants: Vec<ExperimentVariant>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub targeting: Targeting,
    /// Names of the events analyzed for this experiment.
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Percentage of users included in the experiment at all, 0–100.
    pub traffic_allocation: f64,
    #[allow(missing_docs)]
    pub created_at: Timestamp,
    #[allow(missing_docs)]
    pub updated_at: Timestamp,
    /// The experiment assigns nothing before this moment.
    #[serde(default)]
    pub start_date: Option<Timestamp>,
    /// The experiment assigns nothing after this moment.
    #[serde(default)]
    pub end_date: Option<Timestamp>,
}

impl ExperimentConfig {
    /// Create a draft experiment with full traffic allocation and no targeting.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        variants: Vec<ExperimentVariant>,
    ) -> ExperimentConfig {
        let now = Utc::now();
        ExperimentConfig {
            id: id.into(),
            name: name.into(),
            description: None,
            status: ExperimentStatus::Draft,
            variants,
            targeting: Targeting::default(),
            metrics: Vec::new(),
            traffic_allocation: 100.0,
            created_at: now,
            updated_at: now,
            start_date: None,
            end_date: None,
        }
    }

    #[allow(missing_docs)]
    pub fn with_status(mut self, status: ExperimentStatus) -> Self {
        self.status = status;
        self
    }

    #[allow(missing_docs)]
    pub fn with_traffic_allocation(mut self, traffic_allocation: f64) -> Self {
        self.traffic_allocation = traffic_allocation;
        self
    }

    #[allow(missing_docs)]
    pub fn with_targeting(mut self, targeting: Targeting) -> Self {
        self.targeting = targeting;
        self
    }

    #[allow(missing_docs)]
    pub fn with_metrics<S: Into<String>>(mut self, metrics: impl IntoIterator<Item = S>) -> Self {
        self.metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict the experiment to a time window. Either bound may be open.
    pub fn with_schedule(mut self, start: Option<Timestamp>, end: Option<Timestamp>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    /// Check configuration invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        validate_percentage("traffic allocation", self.traffic_allocation)?;
        validate_variants(&self.variants)?;
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(ValidationError::InvalidSchedule);
            }
        }
        Ok(())
    }

    /// Returns `true` if the experiment is running and `now` is within its schedule.
    pub fn is_active(&self, now: Timestamp) -> bool {
        let scheduled = !matches!(self.start_date, Some(t) if now < t)
            && !matches!(self.end_date, Some(t) if now > t);
        self.status == ExperimentStatus::Running && scheduled
    }

    /// Find variant by id.
    pub fn variant(&self, variant_id: &str) -> Option<&ExperimentVariant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    /// Merge a partial update into this experiment. Does not validate.
    pub(crate) fn apply(&mut self, update: ExperimentUpdate) {
        let ExperimentUpdate {
            name,
            description,
            status,
            variants,
            targeting,
            metrics,
            traffic_allocation,
            start_date,
            end_date,
        } = update;

        if let Some(name) = name {
            self.name = name;
        }
        if let Some(description) = description {
            self.description = description;
        }
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(variants) = variants {
            self.variants = variants;
        }
        if let Some(targeting) = targeting {
            self.targeting = targeting;
        }
        if let Some(metrics) = metrics {
            self.metrics = metrics;
        }
        if let Some(traffic_allocation) = traffic_allocation {
            self.traffic_allocation = traffic_allocation;
        }
        if let Some(start_date) = start_date {
            self.start_date = start_date;
        }
        if let Some(end_date) = end_date {
            self.end_date = end_date;
        }
    }
}

/// Partial update for [`ExperimentConfig`]. `None` fields are left unchanged.
///
/// Nullable fields use a nested option: `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct ExperimentUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub status: Option<ExperimentStatus>,
    pub variants: Option<Vec<ExperimentVariant>>,
    pub targeting: Option<Targeting>,
    pub metrics: Option<Vec<String>>,
    pub traffic_allocation: Option<f64>,
    pub start_date: Option<Option<Timestamp>>,
    pub end_date: Option<Option<Timestamp>>,
}

/// Feature flag: a gate with percentage rollout and optional variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    #[serde(default)]
    pub name: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub description: Option<String>,
    /// Master switch.
    pub enabled: bool,
    /// Percentage of users for which the flag is on, 0–100.
    pub rollout_percentage: f64,
    #[allow(missing_docs)]
    #[serde(default)]
    pub targeting: Targeting,
    /// Variants for multivariate flags. Empty for boolean flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<ExperimentVariant>,
    #[allow(missing_docs)]
    pub created_at: Timestamp,
    #[allow(missing_docs)]
    pub updated_at: Timestamp,
}

impl FeatureFlag {
    /// Create an enabled flag with 100% rollout.
    pub fn new(id: impl Into<String>) -> FeatureFlag {
        let now = Utc::now();
        FeatureFlag {
            id: id.into(),
            name: None,
            description: None,
            enabled: true,
            rollout_percentage: 100.0,
            targeting: Targeting::default(),
            variants: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[allow(missing_docs)]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[allow(missing_docs)]
    pub fn with_rollout(mut self, rollout_percentage: f64) -> Self {
        self.rollout_percentage = rollout_percentage;
        self
    }

    #[allow(missing_docs)]
    pub fn with_targeting(mut self, targeting: Targeting) -> Self {
        self.targeting = targeting;
        self
    }

    #[allow(missing_docs)]
    pub fn with_variants(mut self, variants: Vec<ExperimentVariant>) -> Self {
        self.variants = variants;
        self
    }

    /// Check configuration invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        validate_percentage("rollout percentage", self.rollout_percentage)?;
        if !self.variants.is_empty() {
            validate_variants(&self.variants)?;
        }
        Ok(())
    }

    pub(crate) fn apply(&mut self, update: FeatureFlagUpdate) {
        let FeatureFlagUpdate {
            name,
            description,
            enabled,
            rollout_percentage,
            targeting,
            variants,
        } = update;

        if let Some(name) = name {
            self.name = name;
        }
        if let Some(description) = description {
            self.description = description;
        }
        if let Some(enabled) = enabled {
            self.enabled = enabled;
        }
        if let Some(rollout_percentage) = rollout_percentage {
            self.rollout_percentage = rollout_percentage;
        }
        if let Some(targeting) = targeting {
            self.targeting = targeting;
        }
        if let Some(variants) = variants {
            self.variants = variants;
        }
    }
}

/// Partial update for [`FeatureFlag`]. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct FeatureFlagUpdate {
    pub name: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub rollout_percentage: Option<f64>,
    pub targeting: Option<Targeting>,
    pub variants: Option<Vec<ExperimentVariant>>,
}

/// A sticky variant assignment of one user in one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ExperimentAssignment {
    pub user_id: String,
    pub experiment_id: String,
    pub variant_id: String,
    pub assigned_at: Timestamp,
    pub session_id: String,
}

fn validate_percentage(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::PercentageOutOfRange { field, value })
    }
}

fn validate_variants(variants: &[ExperimentVariant]) -> Result<(), ValidationError> {
    if variants.is_empty() {
        return Err(ValidationError::NoVariants);
    }

    let mut seen = HashSet::with_capacity(variants.len());
    for variant in variants {
        if variant.id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if !seen.insert(variant.id.as_str()) {
            return Err(ValidationError::DuplicateVariant(variant.id.clone()));
        }
        if !(0.0..=100.0).contains(&variant.allocation) {
            return Err(ValidationError::VariantAllocationOutOfRange {
                variant: variant.id.clone(),
                allocation: variant.allocation,
            });
        }
    }

    let total: f64 = variants.iter().map(|v| v.allocation).sum();
    if (total - 100.0).abs() > ALLOCATION_TOLERANCE {
        return Err(ValidationError::AllocationSum(total));
    }

    if !variants.iter().any(|v| v.is_control) {
        return Err(ValidationError::NoControlVariant);
    }

    Ok(())
}

/// Pick the variant for a `bucket` in `0..100` by walking cumulative allocations.
///
/// Falls back to the control variant (or the first one) if rounding leaves the bucket uncovered.
pub(crate) fn select_variant(
    variants: &[ExperimentVariant],
    bucket: u64,
) -> Option<&ExperimentVariant> {
    let bucket = bucket as f64;
    let mut cumulative = 0.0;
    variants
        .iter()
        .find(|variant| {
            cumulative += variant.allocation;
            bucket < cumulative
        })
        .or_else(|| variants.iter().find(|v| v.is_control))
        .or_else(|| variants.first())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{
        select_variant, ExperimentConfig, ExperimentStatus, ExperimentUpdate, ExperimentVariant,
        FeatureFlag,
    };
    use crate::error::ValidationError;

    fn experiment(variants: Vec<ExperimentVariant>) -> ExperimentConfig {
        ExperimentConfig::new("e1", "Checkout button", variants)
    }

    #[test]
    fn valid_experiment() {
        let e = experiment(vec![
            ExperimentVariant::control("control", 50.0),
            ExperimentVariant::new("b", 50.0),
        ]);
        assert_eq!(e.validate(), Ok(()));
    }

    #[test]
    fn allocation_sum_must_be_100() {
        let e = experiment(vec![
            ExperimentVariant::control("control", 45.0),
            ExperimentVariant::new("b", 45.0),
        ]);
        assert_eq!(e.validate(), Err(ValidationError::AllocationSum(90.0)));

        // within tolerance
        let e = experiment(vec![
            ExperimentVariant::control("a", 33.333),
            ExperimentVariant::new("b", 33.333),
            ExperimentVariant::new("c", 33.334),
        ]);
        assert_eq!(e.validate(), Ok(()));
    }

    #[test]
    fn control_is_required() {
        let e = experiment(vec![
            ExperimentVariant::new("a", 50.0),
            ExperimentVariant::new("b", 50.0),
        ]);
        assert_eq!(e.validate(), Err(ValidationError::NoControlVariant));
    }

    #[test]
    fn other_invariants() {
        assert_eq!(experiment(vec![]).validate(), Err(ValidationError::NoVariants));

        let e = experiment(vec![
            ExperimentVariant::control("a", 50.0),
            ExperimentVariant::new("a", 50.0),
        ]);
        assert_eq!(
            e.validate(),
            Err(ValidationError::DuplicateVariant("a".to_owned()))
        );

        let e = experiment(vec![
            ExperimentVariant::control("a", 150.0),
            ExperimentVariant::new("b", -50.0),
        ]);
        assert!(matches!(
            e.validate(),
            Err(ValidationError::VariantAllocationOutOfRange { .. })
        ));

        let e = experiment(vec![ExperimentVariant::control("a", 100.0)])
            .with_traffic_allocation(120.0);
        assert!(matches!(
            e.validate(),
            Err(ValidationError::PercentageOutOfRange { .. })
        ));

        let now = Utc::now();
        let e = experiment(vec![ExperimentVariant::control("a", 100.0)])
            .with_schedule(Some(now), Some(now - Duration::days(1)));
        assert_eq!(e.validate(), Err(ValidationError::InvalidSchedule));
    }

    #[test]
    fn is_active_respects_status_and_schedule() {
        let now = Utc::now();
        let e = experiment(vec![ExperimentVariant::control("a", 100.0)]);
        assert!(!e.is_active(now));

        let e = e.with_status(ExperimentStatus::Running);
        assert!(e.is_active(now));

        let future = e
            .clone()
            .with_schedule(Some(now + Duration::hours(1)), None);
        assert!(!future.is_active(now));

        let ended = e.with_schedule(None, Some(now - Duration::hours(1)));
        assert!(!ended.is_active(now));
    }

    #[test]
    fn apply_merges_only_set_fields() {
        let mut e = experiment(vec![ExperimentVariant::control("a", 100.0)])
            .with_metrics(["purchase"]);
        e.description = Some("old".to_owned());

        e.apply(ExperimentUpdate {
            status: Some(ExperimentStatus::Paused),
            description: Some(None),
            ..Default::default()
        });

        assert_eq!(e.status, ExperimentStatus::Paused);
        assert_eq!(e.description, None);
        assert_eq!(e.name, "Checkout button");
        assert_eq!(e.metrics, vec!["purchase".to_owned()]);
    }

    #[test]
    fn select_variant_walks_cumulative_allocation() {
        let variants = vec![
            ExperimentVariant::control("a", 20.0),
            ExperimentVariant::new("b", 30.0),
            ExperimentVariant::new("c", 50.0),
        ];
        assert_eq!(select_variant(&variants, 0).unwrap().id, "a");
        assert_eq!(select_variant(&variants, 19).unwrap().id, "a");
        assert_eq!(select_variant(&variants, 20).unwrap().id, "b");
        assert_eq!(select_variant(&variants, 49).unwrap().id, "b");
        assert_eq!(select_variant(&variants, 50).unwrap().id, "c");
        assert_eq!(select_variant(&variants, 99).unwrap().id, "c");
    }

    #[test]
    fn select_variant_falls_back_to_control() {
        // allocations under 100 leave the upper buckets uncovered
        let variants = vec![
            ExperimentVariant::new("a", 40.0),
            ExperimentVariant::control("b", 40.0),
        ];
        assert_eq!(select_variant(&variants, 79).unwrap().id, "b");
        assert_eq!(select_variant(&variants, 99).unwrap().id, "b");

        let no_control = vec![
            ExperimentVariant::new("a", 40.0),
            ExperimentVariant::new("b", 40.0),
        ];
        assert_eq!(select_variant(&no_control, 99).unwrap().id, "a");
        assert!(select_variant(&[], 10).is_none());
    }

    #[test]
    fn flag_validation() {
        assert_eq!(FeatureFlag::new("new-nav").validate(), Ok(()));
        assert!(FeatureFlag::new("new-nav")
            .with_rollout(101.0)
            .validate()
            .is_err());
        assert_eq!(
            FeatureFlag::new("new-nav")
                .with_variants(vec![ExperimentVariant::new("blue", 100.0)])
                .validate(),
            Err(ValidationError::NoControlVariant)
        );
    }

    #[test]
    fn parses_persisted_experiment() {
        let e: ExperimentConfig = serde_json::from_str(
            r#"{
                "id": "e1",
                "name": "Hero banner",
                "status": "running",
                "variants": [
                    {"id": "control", "name": "Control", "allocation": 50, "isControl": true},
                    {"id": "b", "name": "Video", "allocation": 50, "config": {"autoplay": true}}
                ],
                "targeting": {"devices": ["desktop"]},
                "metrics": ["add_to_cart"],
                "trafficAllocation": 100,
                "createdAt": "2024-05-01T12:00:00.000Z",
                "updatedAt": "2024-05-01T12:00:00.000Z"
            }"#,
        )
        .unwrap();

        assert_eq!(e.status, ExperimentStatus::Running);
        assert_eq!(e.validate(), Ok(()));
        assert_eq!(
            e.variant("b").unwrap().config.get("autoplay"),
            Some(&serde_json::Value::Bool(true))
        );
    }
}
