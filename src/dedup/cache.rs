use anyhow::Result;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::lock_poisoned;
use crate::model::{millis_i64, round_to, COORDINATE_PLACES};
use crate::rules::ModelConfig;

#[derive(Clone, Copy, Debug)]
struct CacheEntry {
    last_accepted: i64,
    timeout_ms: u64,
}

/// Exact-key temporal dedup cache.
///
/// Maps a detection fingerprint to the last time it was accepted. A
/// fingerprint is only accepted again once the resolved timeout has elapsed.
pub struct TemporalCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    rules: Arc<ModelConfig>,
}

impl TemporalCache {
    pub fn new(rules: Arc<ModelConfig>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            rules,
        }
    }

    /// Returns true when the detection should be escalated.
    ///
    /// First sighting of a fingerprint is admitted unless the resolved rule is
    /// `deferred`; in that case it is recorded and suppressed, so only a
    /// re-sighting after the timeout can escalate.
    pub fn admit(
        &self,
        coordinates: &[f32; 4],
        timestamp: i64,
        camera: &str,
        class_id: i32,
        confidence: f32,
    ) -> Result<bool> {
        let limits = self.rules.resolve(camera, class_id)?;
        let key = fingerprint(coordinates, camera, class_id, confidence, limits.confidence);
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| lock_poisoned("temporal cache"))?;
        match entries.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    last_accepted: timestamp,
                    timeout_ms: limits.timeout_ms,
                });
                Ok(!limits.deferred)
            }
            Entry::Occupied(mut slot) => {
                let cached = slot.get().last_accepted;
                if timestamp.saturating_sub(cached) > millis_i64(limits.timeout_ms) {
                    slot.insert(CacheEntry {
                        last_accepted: timestamp,
                        timeout_ms: limits.timeout_ms,
                    });
                    return Ok(true);
                }
                log::warn!(
                    "coordinates {:?} for camera {} class {} confidence {} already processed at {}",
                    coordinates,
                    camera,
                    class_id,
                    confidence,
                    cached
                );
                Ok(false)
            }
        }
    }

    /// Removes entries not accepted within `ttl_multiplier` timeouts of `now`.
    pub fn sweep(&self, now: i64, ttl_multiplier: u32) -> Result<usize> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| lock_poisoned("temporal cache"))?;
        let before = entries.len();
        entries.retain(|_, entry| {
            let ttl = millis_i64(entry.timeout_ms.saturating_mul(u64::from(ttl_multiplier)));
            now.saturating_sub(entry.last_accepted) <= ttl
        });
        Ok(before - entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fingerprint of a detection: rounded coordinates, camera, class and a
/// binary confidence bucket.
///
/// The bucket is "low" when `confidence < model_confidence`, "high"
/// otherwise. It is deliberately separate from the threshold rule's `>`.
pub fn fingerprint(
    coordinates: &[f32; 4],
    camera: &str,
    class_id: i32,
    confidence: f32,
    model_confidence: f32,
) -> String {
    let bucket = if confidence < model_confidence {
        "low"
    } else {
        "high"
    };
    let coords: Vec<String> = coordinates
        .iter()
        .map(|c| format!("{:.2}", round_to(*c, COORDINATE_PLACES)))
        .collect();
    format!("{},{},{},{}", coords.join(","), camera, class_id, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ClassRule, ModelRule};

    const BASE: i64 = 1_706_679_450_000;
    const LOC: [f32; 4] = [0.1, 0.2, 0.3, 0.4];

    fn cache() -> TemporalCache {
        let mut shared = ModelRule::new(0.7, [1, 2]);
        shared.timeout_ms = 1_000;
        let cfg = ModelConfig::shared(shared).with_class(
            6,
            ClassRule {
                deferred: Some(true),
                ..ClassRule::default()
            },
        );
        TemporalCache::new(Arc::new(cfg))
    }

    #[test]
    fn repeat_within_timeout_is_suppressed_then_readmitted() {
        let cache = cache();
        assert!(cache.admit(&LOC, BASE, "CAM1", 2, 0.9).unwrap());
        assert!(!cache.admit(&LOC, BASE + 10, "CAM1", 2, 0.9).unwrap());
        assert!(cache.admit(&LOC, BASE + 1_030, "CAM1", 2, 0.9).unwrap());
        assert!(!cache.admit(&LOC, BASE + 1_040, "CAM1", 2, 0.9).unwrap());
    }

    #[test]
    fn fingerprint_components_separate_entries() {
        let cache = cache();
        let cases: [(&[f32; 4], i64, &str, i32, f32, bool); 7] = [
            (&LOC, BASE, "Q2UV-N5GT-HURS", 2, 0.9, true),
            // other camera
            (&LOC, BASE + 5, "Q2UV-5LPF-HURS", 2, 0.9, true),
            // repeat
            (&LOC, BASE + 10, "Q2UV-N5GT-HURS", 2, 0.9, false),
            // other class
            (&LOC, BASE + 20, "Q2UV-N5GT-HURS", 1, 0.9, true),
            // same bucket, different score
            (&LOC, BASE + 30, "Q2UV-N5GT-HURS", 2, 0.8, false),
            // low bucket
            (&LOC, BASE + 40, "Q2UV-N5GT-HURS", 2, 0.6, true),
            (&LOC, BASE + 1_030, "Q2UV-N5GT-HURS", 2, 0.9, true),
        ];
        for (i, (loc, ts, camera, class_id, score, expected)) in cases.into_iter().enumerate() {
            assert_eq!(
                cache.admit(loc, ts, camera, class_id, score).unwrap(),
                expected,
                "case {}",
                i
            );
        }
    }

    #[test]
    fn deferred_class_needs_a_resighting_after_timeout() {
        let cache = cache();
        assert!(!cache.admit(&LOC, BASE, "CAM1", 6, 0.9).unwrap());
        assert!(!cache.admit(&LOC, BASE + 500, "CAM1", 6, 0.9).unwrap());
        assert!(cache.admit(&LOC, BASE + 1_040, "CAM1", 6, 0.9).unwrap());
    }

    #[test]
    fn timeout_boundary_is_exclusive() {
        let cache = cache();
        assert!(cache.admit(&LOC, BASE, "CAM1", 2, 0.9).unwrap());
        assert!(!cache.admit(&LOC, BASE + 1_000, "CAM1", 2, 0.9).unwrap());
        assert!(cache.admit(&LOC, BASE + 1_001, "CAM1", 2, 0.9).unwrap());
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let cache = cache();
        assert!(cache.admit(&LOC, i64::MAX, "CAM1", 2, 0.9).unwrap());
        assert!(!cache.admit(&LOC, i64::MIN, "CAM1", 2, 0.9).unwrap());
        assert_eq!(cache.sweep(i64::MIN, u32::MAX).unwrap(), 0);

        let mut unbounded = ModelRule::new(0.7, [2]);
        unbounded.timeout_ms = u64::MAX;
        let cache = TemporalCache::new(Arc::new(ModelConfig::shared(unbounded)));
        assert!(cache.admit(&LOC, i64::MIN, "CAM1", 2, 0.9).unwrap());
        assert!(!cache.admit(&LOC, i64::MAX, "CAM1", 2, 0.9).unwrap());
        assert_eq!(cache.sweep(i64::MAX, 10).unwrap(), 0);
    }

    #[test]
    fn bucket_threshold_is_strict_less_than() {
        let at = fingerprint(&LOC, "CAM1", 2, 0.7, 0.7);
        let below = fingerprint(&LOC, "CAM1", 2, 0.69, 0.7);
        assert!(at.ends_with(",high"));
        assert!(below.ends_with(",low"));
        assert_eq!(at, "0.10,0.20,0.30,0.40,CAM1,2,high");
    }

    #[test]
    fn sweep_drops_only_stale_entries() {
        let cache = cache();
        cache.admit(&LOC, BASE, "CAM1", 2, 0.9).unwrap();
        cache.admit(&LOC, BASE + 9_000, "CAM2", 2, 0.9).unwrap();
        let removed = cache.sweep(BASE + 10_500, 10).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unknown_camera_without_shared_rule_is_an_error() {
        let cfg = ModelConfig::default().with_camera("CAM1", ModelRule::new(0.5, [1]));
        let cache = TemporalCache::new(Arc::new(cfg));
        assert!(cache.admit(&LOC, BASE, "CAM9", 1, 0.9).is_err());
    }
}
