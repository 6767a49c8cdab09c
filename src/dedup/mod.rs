//! Duplicate-suppression state: the exact-key temporal cache and the
//! per-(camera, class) spatial neighbour index.
//!
//! Both are owned values injected into the filter stage rather than process
//! globals. Neither evicts on its own; callers sweep explicitly (see
//! [`EvictionPolicy`]).

mod cache;
mod kdtree;
mod spatial;

use std::time::Duration;

pub use cache::{fingerprint, TemporalCache};
pub use kdtree::KdTree;
pub use spatial::{SpatialEntry, SpatialIndex};

const DEFAULT_TTL_MULTIPLIER: u32 = 10;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How aggressively accepted entries are forgotten.
///
/// An entry is removed once it is older than `ttl_multiplier` times its own
/// timeout. A multiplier of zero disables sweeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub ttl_multiplier: u32,
    pub sweep_interval: Duration,
}

impl EvictionPolicy {
    pub fn disabled() -> Self {
        Self {
            ttl_multiplier: 0,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ttl_multiplier > 0
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            ttl_multiplier: DEFAULT_TTL_MULTIPLIER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}
