//! Rule engine: decides which detections in a batch are new violations.

use anyhow::Result;
use std::sync::Arc;

use crate::filter::FilterStage;
use crate::model::{CameraContext, Detection};
use crate::rules::{ModelConfig, RuleKind, CONFINED_SPACE_CLASS};

/// Outcome of evaluating one batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    pub violations: Vec<Detection>,
    /// The violations are relabeled occupancy detections.
    pub confined_space: bool,
}

impl Evaluation {
    /// An escalated empty space still counts, with no boxes to report.
    pub fn has_violation(&self) -> bool {
        self.confined_space || !self.violations.is_empty()
    }
}

pub struct RuleEngine {
    rules: Arc<ModelConfig>,
    filter: FilterStage,
}

impl RuleEngine {
    pub fn new(rules: Arc<ModelConfig>) -> Self {
        let filter = FilterStage::new(rules.clone());
        Self { rules, filter }
    }

    pub fn with_filter(rules: Arc<ModelConfig>, filter: FilterStage) -> Self {
        Self { rules, filter }
    }

    pub fn filter(&self) -> &FilterStage {
        &self.filter
    }

    /// Evaluates a batch without modifying it.
    ///
    /// A detection is a violation when it clears the threshold rule
    /// (`score > confidence`, allowed class) and then the admission filter.
    /// Confined-space cameras additionally run the occupancy counter over
    /// every output of a counted class, whatever its score. When it escalates
    /// and no individual detection qualified, the counted outputs relabeled
    /// to the confined-space class become the result.
    pub fn evaluate(&self, ctx: &CameraContext) -> Result<Evaluation> {
        let camera = ctx.camera_serial.as_str();
        let timestamp = ctx.inference.timestamp;
        let rule = self.rules.camera_rule(camera)?;

        let mut violations = Vec::new();
        if rule.runs(RuleKind::Threshold) {
            for detection in &ctx.inference.outputs {
                let limits = self.rules.resolve(camera, detection.class)?;
                let passes_threshold = detection.score > limits.confidence
                    && rule.allowed_classes.contains(&detection.class);
                if passes_threshold && self.filter.admit(detection, camera, timestamp)? {
                    violations.push(detection.clone());
                }
            }
        }

        let Some(occupancy) = rule.occupancy() else {
            return Ok(Evaluation {
                violations,
                confined_space: false,
            });
        };

        let counted: Vec<&Detection> = ctx
            .inference
            .outputs
            .iter()
            .filter(|d| occupancy.counted_classes.contains(&d.class))
            .collect();
        let escalated = self
            .filter
            .count_violation_pending(&counted, camera, timestamp, &occupancy)?;
        if !escalated || !violations.is_empty() {
            return Ok(Evaluation {
                violations,
                confined_space: false,
            });
        }

        log::info!(
            "confined space occupancy {} below {} on camera {} at {}",
            counted.len(),
            occupancy.required_count,
            camera,
            timestamp
        );
        let relabeled = counted
            .into_iter()
            .map(|detection| Detection {
                class: CONFINED_SPACE_CLASS,
                ..detection.clone()
            })
            .collect();
        Ok(Evaluation {
            violations: relabeled,
            confined_space: true,
        })
    }

    /// Evaluates and narrows the batch in place to the surviving violations.
    /// Returns whether any violation was found; the context is left untouched
    /// otherwise.
    pub fn apply(&self, ctx: &mut CameraContext) -> Result<bool> {
        let evaluation = self.evaluate(ctx)?;
        if !evaluation.has_violation() {
            return Ok(false);
        }
        ctx.violation_detected = true;
        ctx.confined_space_violation = evaluation.confined_space;
        ctx.inference.outputs = evaluation.violations;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DetectionBatch;
    use crate::rules::ModelRule;

    const BASE: i64 = 1_706_679_450_000;

    fn det(class: i32, location: [f32; 4], score: f32) -> Detection {
        Detection {
            class,
            id: 1,
            location,
            score,
        }
    }

    fn ctx(camera: &str, timestamp: i64, outputs: Vec<Detection>) -> CameraContext {
        CameraContext::new(camera, DetectionBatch { outputs, timestamp })
    }

    fn engine() -> RuleEngine {
        let mut shared = ModelRule::new(0.7, [1, 2]);
        shared.timeout_ms = 1_000;
        shared.radius_limit = 0.1;
        RuleEngine::new(Arc::new(ModelConfig::shared(shared)))
    }

    #[test]
    fn threshold_is_strictly_greater_and_class_filtered() {
        let e = engine();
        let batch = ctx(
            "CAM1",
            BASE,
            vec![
                det(1, [0.1, 0.1, 0.2, 0.2], 0.7),
                det(3, [0.4, 0.4, 0.5, 0.5], 0.95),
                det(2, [0.7, 0.7, 0.8, 0.8], 0.71),
            ],
        );
        let eval = e.evaluate(&batch).unwrap();
        assert_eq!(eval.violations.len(), 1);
        assert_eq!(eval.violations[0].class, 2);
        assert!(!eval.confined_space);
    }

    #[test]
    fn below_threshold_detections_leave_no_state() {
        let e = engine();
        let batch = ctx("CAM1", BASE, vec![det(1, [0.1, 0.1, 0.2, 0.2], 0.5)]);
        assert!(!e.evaluate(&batch).unwrap().has_violation());
        assert!(e.filter().cache().is_empty());
    }

    #[test]
    fn apply_narrows_outputs_and_flags() {
        let e = engine();
        let mut batch = ctx(
            "CAM1",
            BASE,
            vec![
                det(1, [0.1, 0.1, 0.2, 0.2], 0.9),
                det(1, [0.5, 0.5, 0.6, 0.6], 0.3),
            ],
        );
        assert!(e.apply(&mut batch).unwrap());
        assert!(batch.violation_detected);
        assert_eq!(batch.inference.outputs.len(), 1);

        let mut repeat = ctx("CAM1", BASE + 100, vec![det(1, [0.1, 0.1, 0.2, 0.2], 0.9)]);
        assert!(!e.apply(&mut repeat).unwrap());
        assert!(!repeat.violation_detected);
        assert_eq!(repeat.inference.outputs.len(), 1);
    }

    #[test]
    fn unknown_camera_without_default_fails_the_batch() {
        let cfg = ModelConfig::default().with_camera("CAM1", ModelRule::new(0.5, [1]));
        let e = RuleEngine::new(Arc::new(cfg));
        let batch = ctx("CAM2", BASE, vec![det(1, [0.1, 0.1, 0.2, 0.2], 0.9)]);
        assert!(e.evaluate(&batch).is_err());
    }
}
