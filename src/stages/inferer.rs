use anyhow::Result;
use std::sync::Arc;

use crate::dedup::EvictionPolicy;
use crate::engine::RuleEngine;
use crate::model::CameraContext;
use crate::pipeline::{Processor, ShutdownSignal};
use crate::rules::ModelConfig;

/// Runs the rule engine over each batch.
///
/// Only violations are forwarded unless `forward_all` is set (used when the
/// audit log records every batch); downstream collaborators key off
/// `violation_detected`. Dedup state is swept against the newest batch
/// timestamp seen, once per `sweep_interval` of data time.
pub struct Inferer {
    engine: RuleEngine,
    eviction: EvictionPolicy,
    forward_all: bool,
    newest: Option<i64>,
    last_sweep: Option<i64>,
}

impl Inferer {
    pub fn new(rules: Arc<ModelConfig>, eviction: EvictionPolicy, forward_all: bool) -> Self {
        Self::with_engine(RuleEngine::new(rules), eviction, forward_all)
    }

    pub fn with_engine(engine: RuleEngine, eviction: EvictionPolicy, forward_all: bool) -> Self {
        Self {
            engine,
            eviction,
            forward_all,
            newest: None,
            last_sweep: None,
        }
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    fn maybe_sweep(&mut self, timestamp: i64) -> Result<()> {
        let newest = self.newest.map_or(timestamp, |n| n.max(timestamp));
        self.newest = Some(newest);
        if !self.eviction.is_enabled() {
            return Ok(());
        }
        let Some(last) = self.last_sweep else {
            self.last_sweep = Some(newest);
            return Ok(());
        };
        let interval =
            i64::try_from(self.eviction.sweep_interval.as_millis()).unwrap_or(i64::MAX);
        if newest.saturating_sub(last) < interval {
            return Ok(());
        }
        let (entries, points) = self
            .engine
            .filter()
            .sweep(newest, self.eviction.ttl_multiplier)?;
        self.last_sweep = Some(newest);
        if entries + points > 0 {
            log::debug!(
                "evicted {} cache entries and {} spatial points older than {}x timeout",
                entries,
                points,
                self.eviction.ttl_multiplier
            );
        }
        Ok(())
    }
}

impl Processor for Inferer {
    fn process(
        &mut self,
        mut ctx: CameraContext,
        _shutdown: &ShutdownSignal,
    ) -> Result<Option<CameraContext>> {
        self.maybe_sweep(ctx.inference.timestamp)?;
        if self.engine.apply(&mut ctx)? {
            log::info!(
                "violation detected for {} at {}{}",
                ctx.camera_serial,
                ctx.inference.timestamp,
                if ctx.confined_space_violation {
                    " (confined space)"
                } else {
                    ""
                }
            );
            return Ok(Some(ctx));
        }
        Ok(self.forward_all.then_some(ctx))
    }
}
