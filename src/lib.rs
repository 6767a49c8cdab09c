//! Violation Pipeline
//!
//! Turns per-frame object detections from edge cameras into deduplicated
//! safety-violation alerts.
//!
//! # Architecture
//!
//! Processing is a graph of stages connected by channels:
//!
//! 1. **Ingest**: MQTT detection batches are decoded into camera contexts.
//! 2. **Inferer**: the rule engine thresholds detections, suppresses repeats
//!    (temporal cache plus per-camera spatial index) and counts occupancy.
//! 3. **Collaborators**: snapshot retrieval, box rendering, notification,
//!    blob storage and the SQLite audit trail act on the verdict.
//!
//! # Module Structure
//!
//! - `model`: detections, batches and the camera context passed between stages
//! - `rules`: per-model, per-camera and per-class thresholds
//! - `dedup`: temporal cache, kd-tree and spatial index
//! - `filter`: the dedup filter stage and occupancy counters
//! - `engine`: the rule engine combining thresholds, filter and counters
//! - `pipeline`: router, stage host and shutdown signal
//! - `ingest`, `stages`: stage implementations

pub mod config;
pub mod dedup;
pub mod engine;
pub mod filter;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod rules;
pub mod stages;

pub use config::PipelineConfig;
pub use dedup::{EvictionPolicy, KdTree, SpatialIndex, TemporalCache};
pub use engine::{Evaluation, RuleEngine};
pub use filter::{FilterStage, OccupancyCounter};
pub use model::{BoxOrder, CameraContext, Detection, DetectionBatch};
pub use pipeline::{PipelineHandle, PipelineHost, Router, ShutdownSignal};
pub use retry::RetryPolicy;
pub use rules::{ModelConfig, ModelRule, RuleKind};

/// Broken internal state. A stage that hits one halts the pipeline instead
/// of dropping the batch and carrying on.
#[derive(Debug)]
pub struct InvariantViolation {
    pub code: &'static str,
    pub message: String,
}

impl InvariantViolation {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
impl std::error::Error for InvariantViolation {}

pub(crate) fn lock_poisoned(what: &str) -> anyhow::Error {
    InvariantViolation::new("LOCK_POISONED", format!("{} lock poisoned", what)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_poisoning_is_an_invariant_violation() {
        let err = lock_poisoned("temporal cache");
        let violation = err
            .downcast_ref::<InvariantViolation>()
            .expect("invariant violation");
        assert_eq!(violation.code, "LOCK_POISONED");
        assert_eq!(err.to_string(), "LOCK_POISONED: temporal cache lock poisoned");
    }
}
