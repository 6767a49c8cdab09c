use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};

use super::shutdown::{ShutdownSignal, POLL_INTERVAL};
use crate::model::CameraContext;

/// Declarative stage graph: stage name to the names of its downstream stages.
pub type Topology = BTreeMap<String, Vec<String>>;

/// Channel endpoints handed to one stage.
///
/// The stage reads its single inbound receiver and writes every unit of work
/// it emits to each outbound sender. It never learns its neighbours' names.
pub struct StageIo {
    name: String,
    inbound: Receiver<CameraContext>,
    outbound: Vec<Sender<CameraContext>>,
}

impl StageIo {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks for the next unit of work. Returns `None` once shutdown is
    /// triggered or every upstream writer is gone.
    pub fn recv(&self, shutdown: &ShutdownSignal) -> Option<CameraContext> {
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            match self.inbound.recv_timeout(POLL_INTERVAL) {
                Ok(ctx) => return Some(ctx),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Sends `ctx` to every downstream stage. Returns how many accepted it.
    pub fn forward(&self, ctx: CameraContext) -> usize {
        let Some((last, rest)) = self.outbound.split_last() else {
            return 0;
        };
        let mut delivered = 0;
        for sender in rest {
            if sender.send(ctx.clone()).is_ok() {
                delivered += 1;
            }
        }
        if last.send(ctx).is_ok() {
            delivered += 1;
        }
        if delivered < self.outbound.len() {
            log::debug!(
                "stage {}: {} downstream stage(s) already stopped",
                self.name,
                self.outbound.len() - delivered
            );
        }
        delivered
    }

    pub fn is_terminal(&self) -> bool {
        self.outbound.is_empty()
    }

    pub fn fan_out(&self) -> usize {
        self.outbound.len()
    }
}

/// Builds the channel graph for a topology.
///
/// Every stage gets exactly one unbounded inbound channel. Each upstream
/// stage holds a clone of that channel's writer, so a stage with several
/// upstreams still has a single reader. The router itself keeps one writer
/// per stage for injection; dropping the router releases them, after which
/// a stage's input closes when all of its upstreams have exited.
pub struct Router {
    stages: BTreeMap<String, StageIo>,
    injectors: HashMap<String, Sender<CameraContext>>,
}

impl Router {
    pub fn from_topology(topology: &Topology) -> Result<Self> {
        let nodes = validate_topology(topology)?;

        let mut receivers = BTreeMap::new();
        let mut injectors = HashMap::new();
        for name in &nodes {
            let (tx, rx) = mpsc::channel();
            receivers.insert(name.clone(), rx);
            injectors.insert(name.clone(), tx);
        }

        let mut stages = BTreeMap::new();
        for (name, inbound) in receivers {
            let mut outbound = Vec::new();
            for downstream in topology.get(&name).into_iter().flatten() {
                let sender = injectors
                    .get(downstream)
                    .ok_or_else(|| anyhow!("stage '{}' has no channel", downstream))?;
                outbound.push(sender.clone());
            }
            log::debug!("stage {} fans out to {} stage(s)", name, outbound.len());
            stages.insert(
                name.clone(),
                StageIo {
                    name,
                    inbound,
                    outbound,
                },
            );
        }
        Ok(Self { stages, injectors })
    }

    /// Every stage named in the topology, as keys or as downstream entries.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.injectors.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.injectors.contains_key(name)
    }

    /// Hands out a stage's channel endpoints. Each stage can be taken once.
    pub fn take(&mut self, name: &str) -> Result<StageIo> {
        self.stages.remove(name).ok_or_else(|| {
            if self.contains(name) {
                anyhow!("stage '{}' was already taken", name)
            } else {
                anyhow!("stage '{}' is not part of the pipeline topology", name)
            }
        })
    }

    /// A writer into `name`'s inbound channel.
    pub fn injector(&self, name: &str) -> Result<Sender<CameraContext>> {
        self.injectors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("stage '{}' is not part of the pipeline topology", name))
    }

    /// Stages whose endpoints have not been taken yet.
    pub fn remaining(&self) -> Vec<String> {
        self.stages.keys().cloned().collect()
    }
}

/// Rejects empty names, self-loops, repeated edges and cycles. Returns the
/// full set of stage names.
fn validate_topology(topology: &Topology) -> Result<BTreeSet<String>> {
    if topology.is_empty() {
        return Err(anyhow!("pipeline topology is empty"));
    }
    let mut nodes = BTreeSet::new();
    for (name, downstream) in topology {
        if name.trim().is_empty() {
            return Err(anyhow!("pipeline stage names must not be empty"));
        }
        nodes.insert(name.clone());
        let mut seen = BTreeSet::new();
        for next in downstream {
            if next.trim().is_empty() {
                return Err(anyhow!("stage '{}' lists an empty downstream name", name));
            }
            if next == name {
                return Err(anyhow!("stage '{}' lists itself as downstream", name));
            }
            if !seen.insert(next.as_str()) {
                return Err(anyhow!("stage '{}' lists '{}' more than once", name, next));
            }
            nodes.insert(next.clone());
        }
    }

    // Kahn's algorithm; anything left over sits on a cycle.
    let mut indegree: BTreeMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();
    for downstream in topology.values() {
        for next in downstream {
            if let Some(count) = indegree.get_mut(next.as_str()) {
                *count += 1;
            }
        }
    }
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut visited = 0;
    while let Some(name) = ready.pop() {
        visited += 1;
        for next in topology.get(name).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(next.as_str()) {
                *count -= 1;
                if *count == 0 {
                    ready.push(next.as_str());
                }
            }
        }
    }
    if visited != nodes.len() {
        let cyclic: Vec<&str> = indegree
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, _)| *name)
            .collect();
        return Err(anyhow!(
            "pipeline topology contains a cycle through: {}",
            cyclic.join(", ")
        ));
    }
    Ok(nodes)
}
