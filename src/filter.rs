//! Admission filter: bounds → temporal → spatial, plus the sparse-occupancy
//! counter used by confined-space cameras.
//!
//! The predicates mutate state when evaluated and are short-circuited, so a
//! detection only touches the cache if it is in bounds, and only touches the
//! spatial index if the cache admitted it. The order must not change.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::dedup::{SpatialIndex, TemporalCache};
use crate::lock_poisoned;
use crate::model::{millis_i64, Detection};
use crate::rules::{ModelConfig, OccupancyRule};

pub struct FilterStage {
    cache: TemporalCache,
    spatial: SpatialIndex,
    occupancy: OccupancyCounter,
}

impl FilterStage {
    pub fn new(rules: Arc<ModelConfig>) -> Self {
        Self::from_parts(
            TemporalCache::new(rules.clone()),
            SpatialIndex::new(rules),
            OccupancyCounter::new(),
        )
    }

    pub fn from_parts(
        cache: TemporalCache,
        spatial: SpatialIndex,
        occupancy: OccupancyCounter,
    ) -> Self {
        Self {
            cache,
            spatial,
            occupancy,
        }
    }

    /// Full admission check for one detection.
    pub fn admit(&self, detection: &Detection, camera: &str, timestamp: i64) -> Result<bool> {
        Ok(in_bounds(detection)
            && self.cache.admit(
                &detection.location,
                timestamp,
                camera,
                detection.class,
                detection.score,
            )?
            && self.spatial.admit(detection, camera, timestamp)?)
    }

    /// Sparse-occupancy check over the counted outputs of one batch. An
    /// empty slice is the lowest possible occupancy, not a reset.
    pub fn count_violation_pending<T>(
        &self,
        outputs: &[T],
        camera: &str,
        timestamp: i64,
        rule: &OccupancyRule,
    ) -> Result<bool> {
        self.occupancy.pending(
            outputs.len(),
            camera,
            timestamp,
            rule.required_count,
            rule.count_timeout_ms,
        )
    }

    pub fn occupancy(&self) -> &OccupancyCounter {
        &self.occupancy
    }

    pub fn cache(&self) -> &TemporalCache {
        &self.cache
    }

    pub fn spatial(&self) -> &SpatialIndex {
        &self.spatial
    }

    /// Evicts stale cache entries and spatial points. Returns
    /// `(cache_entries, spatial_points)` removed.
    pub fn sweep(&self, now: i64, ttl_multiplier: u32) -> Result<(usize, usize)> {
        Ok((
            self.cache.sweep(now, ttl_multiplier)?,
            self.spatial.sweep(now, ttl_multiplier)?,
        ))
    }
}

/// Every coordinate in `[0, 1]`. Failures are malformed input and logged.
pub fn in_bounds(detection: &Detection) -> bool {
    let ok = detection.in_bounds();
    if !ok {
        log::error!(
            "coordinate bounds {:?} are not within 0 and 1; dropping detection",
            detection.location
        );
    }
    ok
}

/// Per-camera cooldown tracking for sparse occupancy.
#[derive(Default)]
pub struct OccupancyCounter {
    cooldowns: Mutex<HashMap<String, i64>>,
}

impl OccupancyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once occupancy has stayed below `required` for longer than
    /// `timeout_ms` since the cooldown started.
    pub fn pending(
        &self,
        matching: usize,
        camera: &str,
        timestamp: i64,
        required: usize,
        timeout_ms: u64,
    ) -> Result<bool> {
        let mut cooldowns = self
            .cooldowns
            .lock()
            .map_err(|_| lock_poisoned("occupancy counter"))?;
        if matching >= required {
            cooldowns.remove(camera);
            return Ok(false);
        }
        match cooldowns.get(camera) {
            None => {
                cooldowns.insert(camera.to_string(), timestamp);
                log::debug!(
                    "camera {} occupancy {} below {}; cooldown started at {}",
                    camera,
                    matching,
                    required,
                    timestamp
                );
                Ok(false)
            }
            Some(&started) => Ok(timestamp.saturating_sub(started) > millis_i64(timeout_ms)),
        }
    }

    pub fn cooldown_started(&self, camera: &str) -> Option<i64> {
        self.cooldowns
            .lock()
            .ok()
            .and_then(|c| c.get(camera).copied())
    }
}
