use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::kdtree::KdTree;
use crate::lock_poisoned;
use crate::model::{millis_i64, Detection};
use crate::rules::ModelConfig;

/// Accepted detection stored in a partition's tree.
#[derive(Clone, Debug)]
pub struct SpatialEntry {
    pub detection: Detection,
    pub timestamp: i64,
    timeout_ms: u64,
}

/// Per-(camera, class) nearest-neighbour index of accepted midpoints.
///
/// Partitions are created lazily on first use. A detection is rejected when
/// any stored midpoint within the resolved radius was accepted less than the
/// resolved timeout ago.
pub struct SpatialIndex {
    partitions: Mutex<HashMap<(String, i32), KdTree<SpatialEntry>>>,
    rules: Arc<ModelConfig>,
}

impl SpatialIndex {
    pub fn new(rules: Arc<ModelConfig>) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            rules,
        }
    }

    pub fn admit(&self, detection: &Detection, camera: &str, timestamp: i64) -> Result<bool> {
        let limits = self.rules.resolve(camera, detection.class)?;
        let midpoint = detection.midpoint();
        let mut partitions = self
            .partitions
            .lock()
            .map_err(|_| lock_poisoned("spatial index"))?;
        let tree = partitions
            .entry((camera.to_string(), detection.class))
            .or_default();

        let timeout = millis_i64(limits.timeout_ms);
        let recent_neighbour = tree
            .radius_search(midpoint, limits.radius_limit)
            .into_iter()
            .any(|(_, entry)| timestamp.saturating_sub(entry.timestamp) < timeout);
        if recent_neighbour {
            log::warn!(
                "coordinates {:?} on camera {} are neighbours to an already processed detection",
                detection.location,
                camera
            );
            return Ok(false);
        }

        tree.insert(
            midpoint,
            SpatialEntry {
                detection: detection.clone(),
                timestamp,
                timeout_ms: limits.timeout_ms,
            },
        );
        Ok(true)
    }

    /// Removes points older than `ttl_multiplier` timeouts; empty partitions
    /// are dropped.
    pub fn sweep(&self, now: i64, ttl_multiplier: u32) -> Result<usize> {
        let mut partitions = self
            .partitions
            .lock()
            .map_err(|_| lock_poisoned("spatial index"))?;
        let mut removed = 0;
        for tree in partitions.values_mut() {
            removed += tree.retain(|entry| {
                let ttl = millis_i64(entry.timeout_ms.saturating_mul(u64::from(ttl_multiplier)));
                now.saturating_sub(entry.timestamp) <= ttl
            });
        }
        partitions.retain(|_, tree| !tree.is_empty());
        Ok(removed)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn point_count(&self) -> usize {
        self.partitions
            .lock()
            .map(|p| p.values().map(KdTree::len).sum())
            .unwrap_or(0)
    }
}
