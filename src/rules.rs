//! Model rule configuration and per-camera / per-class resolution.
//!
//! Rules are loaded once at startup and shared read-only (`Arc<ModelConfig>`)
//! between the rule engine, the temporal cache and the spatial index.
//! Resolution order for a `(camera, class)` pair:
//!
//! 1. the camera's own entry, or the `Shared` entry when the camera has none;
//! 2. any per-class override, applied field by field on top.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Name of the fallback rule entry.
pub const SHARED_RULE: &str = "Shared";

/// Class id written onto detections escalated by the occupancy counter.
pub const CONFINED_SPACE_CLASS: i32 = -1;

const DEFAULT_TIMEOUT_MS: u64 = 180_000;

/// Longest accepted suppression or debounce window, 30 days.
pub const MAX_TIMEOUT_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// Which checks a camera runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    Threshold,
    ConfinedSpace,
}

/// Per-camera rule entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRule {
    pub confidence: f32,
    #[serde(default, alias = "classes")]
    pub allowed_classes: BTreeSet<i32>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub radius_limit: f32,
    #[serde(default)]
    pub deferred: bool,
    #[serde(default = "default_rule_kinds")]
    pub rules: BTreeSet<RuleKind>,
    /// Classes counted by the confined-space rule.
    #[serde(default)]
    pub counted_classes: BTreeSet<i32>,
    #[serde(default)]
    pub count_threshold: Option<u32>,
    #[serde(default)]
    pub count_timeout_ms: Option<u64>,
}

/// Optional per-class overrides.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_limit: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<bool>,
}

/// Limits that apply to one `(camera, class)` pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedLimits {
    pub confidence: f32,
    pub timeout_ms: u64,
    pub radius_limit: f32,
    pub deferred: bool,
}

/// Sparse-occupancy parameters for a confined-space camera.
#[derive(Clone, Debug, PartialEq)]
pub struct OccupancyRule {
    pub counted_classes: BTreeSet<i32>,
    pub required_count: usize,
    pub count_timeout_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Camera serial (or `Shared`) to rule.
    #[serde(default)]
    pub models: BTreeMap<String, ModelRule>,
    /// Class id (as a string key) to overrides.
    #[serde(default)]
    pub classes: BTreeMap<String, ClassRule>,
}

impl ModelRule {
    pub fn new(confidence: f32, allowed_classes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            confidence,
            allowed_classes: allowed_classes.into_iter().collect(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            radius_limit: 0.0,
            deferred: false,
            rules: default_rule_kinds(),
            counted_classes: BTreeSet::new(),
            count_threshold: None,
            count_timeout_ms: None,
        }
    }

    pub fn runs(&self, kind: RuleKind) -> bool {
        self.rules.contains(&kind)
    }

    /// Occupancy parameters, present only when the camera runs `ConfinedSpace`.
    pub fn occupancy(&self) -> Option<OccupancyRule> {
        if !self.runs(RuleKind::ConfinedSpace) {
            return None;
        }
        Some(OccupancyRule {
            counted_classes: self.counted_classes.clone(),
            required_count: self.count_threshold.unwrap_or(1) as usize,
            count_timeout_ms: self.count_timeout_ms.unwrap_or(self.timeout_ms),
        })
    }

    fn validate(&self, name: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!(
                "model '{}': confidence {} must be within 0 and 1",
                name,
                self.confidence
            ));
        }
        if !(self.radius_limit >= 0.0) {
            return Err(anyhow!(
                "model '{}': radius_limit must be non-negative",
                name
            ));
        }
        check_timeout(&format!("model '{}'", name), "timeout_ms", self.timeout_ms)?;
        if let Some(count_timeout) = self.count_timeout_ms {
            check_timeout(&format!("model '{}'", name), "count_timeout_ms", count_timeout)?;
        }
        if !self.runs(RuleKind::Threshold) {
            return Err(anyhow!("model '{}': the Threshold rule is mandatory", name));
        }
        if self.runs(RuleKind::ConfinedSpace) {
            if self.counted_classes.is_empty() {
                return Err(anyhow!(
                    "model '{}': ConfinedSpace requires counted_classes",
                    name
                ));
            }
            match self.count_threshold {
                Some(n) if n >= 1 => {}
                _ => {
                    return Err(anyhow!(
                        "model '{}': ConfinedSpace requires count_threshold >= 1",
                        name
                    ))
                }
            }
        }
        Ok(())
    }
}

impl ModelConfig {
    /// Config with only a `Shared` entry.
    pub fn shared(rule: ModelRule) -> Self {
        let mut models = BTreeMap::new();
        models.insert(SHARED_RULE.to_string(), rule);
        Self {
            models,
            classes: BTreeMap::new(),
        }
    }

    pub fn with_camera(mut self, camera: impl Into<String>, rule: ModelRule) -> Self {
        self.models.insert(camera.into(), rule);
        self
    }

    pub fn with_class(mut self, class_id: i32, rule: ClassRule) -> Self {
        self.classes.insert(class_id.to_string(), rule);
        self
    }

    /// The camera's rule entry, falling back to `Shared`.
    pub fn camera_rule(&self, camera: &str) -> Result<&ModelRule> {
        self.models
            .get(camera)
            .or_else(|| self.models.get(SHARED_RULE))
            .ok_or_else(|| {
                anyhow!(
                    "no model rule for camera '{}' and no '{}' default",
                    camera,
                    SHARED_RULE
                )
            })
    }

    /// Limits for one class seen on one camera.
    pub fn resolve(&self, camera: &str, class_id: i32) -> Result<ResolvedLimits> {
        let base = self.camera_rule(camera)?;
        let mut limits = ResolvedLimits {
            confidence: base.confidence,
            timeout_ms: base.timeout_ms,
            radius_limit: base.radius_limit,
            deferred: base.deferred,
        };
        if let Some(class_rule) = self.classes.get(&class_id.to_string()) {
            if let Some(confidence) = class_rule.confidence {
                limits.confidence = confidence;
            }
            if let Some(timeout_ms) = class_rule.timeout_ms {
                limits.timeout_ms = timeout_ms;
            }
            if let Some(radius_limit) = class_rule.radius_limit {
                limits.radius_limit = radius_limit;
            }
            if let Some(deferred) = class_rule.deferred {
                limits.deferred = deferred;
            }
        }
        Ok(limits)
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(anyhow!("at least one model rule must be configured"));
        }
        if !self.models.contains_key(SHARED_RULE) {
            log::warn!(
                "no '{}' model rule; cameras without an entry will be rejected",
                SHARED_RULE
            );
        }
        for (name, rule) in &self.models {
            rule.validate(name)?;
        }
        for (key, class_rule) in &self.classes {
            key.parse::<i32>()
                .map_err(|_| anyhow!("class override key '{}' is not a class id", key))?;
            if let Some(confidence) = class_rule.confidence {
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(anyhow!(
                        "class '{}': confidence {} must be within 0 and 1",
                        key,
                        confidence
                    ));
                }
            }
            if let Some(timeout) = class_rule.timeout_ms {
                check_timeout(&format!("class '{}'", key), "timeout_ms", timeout)?;
            }
            if let Some(radius) = class_rule.radius_limit {
                if !(radius >= 0.0) {
                    return Err(anyhow!("class '{}': radius_limit must be non-negative", key));
                }
            }
        }
        Ok(())
    }
}

fn check_timeout(owner: &str, field: &str, value: u64) -> Result<()> {
    if value > MAX_TIMEOUT_MS {
        return Err(anyhow!(
            "{}: {} {} exceeds the {} ms maximum",
            owner,
            field,
            value,
            MAX_TIMEOUT_MS
        ));
    }
    Ok(())
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_rule_kinds() -> BTreeSet<RuleKind> {
    BTreeSet::from([RuleKind::Threshold])
}
