use anyhow::{anyhow, Result};
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

use super::router::{Router, StageIo};
use super::shutdown::ShutdownSignal;
use crate::model::CameraContext;
use crate::InvariantViolation;

/// A long-running pipeline stage.
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Runs until shutdown or until its input closes. An `Err` or a panic
    /// is fatal to the whole pipeline.
    fn run(&mut self, io: StageIo, shutdown: &ShutdownSignal) -> Result<()>;
}

/// Per-unit business logic, hosted by [`ProcessorStage`].
pub trait Processor: Send {
    /// Returns the context to forward, or `None` to drop it.
    fn process(
        &mut self,
        ctx: CameraContext,
        shutdown: &ShutdownSignal,
    ) -> Result<Option<CameraContext>>;
}

/// Read loop shared by every stage that handles one context at a time.
///
/// Per-batch errors are logged with the camera and batch timestamp and the
/// loop continues. [`InvariantViolation`] errors stop the stage.
pub struct ProcessorStage<P> {
    name: String,
    processor: P,
}

impl<P: Processor> ProcessorStage<P> {
    pub fn new(name: impl Into<String>, processor: P) -> Self {
        Self {
            name: name.into(),
            processor,
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }
}

impl<P: Processor> Stage for ProcessorStage<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, io: StageIo, shutdown: &ShutdownSignal) -> Result<()> {
        let mut handled = 0u64;
        while let Some(ctx) = io.recv(shutdown) {
            let camera = ctx.camera_serial.clone();
            let timestamp = ctx.inference.timestamp;
            match self.processor.process(ctx, shutdown) {
                Ok(Some(out)) => {
                    io.forward(out);
                }
                Ok(None) => {}
                Err(err) if err.downcast_ref::<InvariantViolation>().is_some() => {
                    return Err(err.context(format!(
                        "stage {} halted on camera {} batch {}",
                        self.name, camera, timestamp
                    )));
                }
                Err(err) => {
                    log::error!(
                        "stage {} dropped batch from camera {} at {}: {:#}",
                        self.name,
                        camera,
                        timestamp,
                        err
                    );
                }
            }
            handled += 1;
        }
        log::info!("stage {} stopped after {} batch(es)", self.name, handled);
        Ok(())
    }
}

/// Lifecycle of a running pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    Stopped,
    Running,
    Draining,
}

/// Owns the stage implementations and schedules one thread per stage.
pub struct PipelineHost {
    router: Router,
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineHost {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            stages: Vec::new(),
        }
    }

    pub fn register(&mut self, stage: Box<dyn Stage>) -> Result<()> {
        let name = stage.name().to_string();
        if !self.router.contains(&name) {
            return Err(anyhow!(
                "stage '{}' is registered but not part of the pipeline topology",
                name
            ));
        }
        if self.stages.iter().any(|s| s.name() == name) {
            return Err(anyhow!("stage '{}' is registered twice", name));
        }
        self.stages.push(stage);
        Ok(())
    }

    pub fn injector(&self, name: &str) -> Result<Sender<CameraContext>> {
        self.router.injector(name)
    }

    /// Starts every stage. Fails before spawning anything if a topology
    /// stage has no implementation.
    pub fn start(mut self, shutdown: ShutdownSignal) -> Result<PipelineHandle> {
        let registered: BTreeSet<&str> = self.stages.iter().map(|s| s.name()).collect();
        let missing: Vec<&str> = self
            .router
            .stage_names()
            .filter(|name| !registered.contains(name))
            .collect();
        if !missing.is_empty() {
            let mut missing: Vec<String> = missing.into_iter().map(str::to_string).collect();
            missing.sort();
            return Err(anyhow!(
                "no implementation registered for stage(s): {}",
                missing.join(", ")
            ));
        }
        drop(registered);

        let mut wired = Vec::with_capacity(self.stages.len());
        for stage in self.stages.drain(..) {
            let io = self.router.take(stage.name())?;
            wired.push((stage, io));
        }
        // Release the injection writers so inputs close as upstreams exit.
        drop(self.router);

        let mut workers = Vec::with_capacity(wired.len());
        for (mut stage, io) in wired {
            let name = stage.name().to_string();
            let stage_name = name.clone();
            let stage_shutdown = shutdown.clone();
            let join = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let result =
                        panic::catch_unwind(AssertUnwindSafe(|| stage.run(io, &stage_shutdown)))
                            .unwrap_or_else(|payload| {
                                Err(anyhow!(
                                    "stage {} panicked: {}",
                                    stage_name,
                                    panic_message(payload.as_ref())
                                ))
                            });
                    if let Err(err) = &result {
                        log::error!("stage {} failed: {:#}", stage_name, err);
                        stage_shutdown.trigger();
                    }
                    result
                })
                .map_err(|err| {
                    shutdown.trigger();
                    anyhow!("failed to spawn stage {}: {}", name, err)
                })?;
            workers.push(Worker { name, join });
        }
        log::info!("pipeline running with {} stage(s)", workers.len());
        Ok(PipelineHandle { shutdown, workers })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

struct Worker {
    name: String,
    join: JoinHandle<Result<()>>,
}

pub struct PipelineHandle {
    shutdown: ShutdownSignal,
    workers: Vec<Worker>,
}

impl PipelineHandle {
    pub fn state(&self) -> HostState {
        if self.workers.iter().all(|w| w.join.is_finished()) {
            HostState::Stopped
        } else if self.shutdown.is_triggered() {
            HostState::Draining
        } else {
            HostState::Running
        }
    }

    /// Signals every stage to finish its in-flight work and exit.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Waits for every stage and aggregates their failures into one error.
    pub fn join(self) -> Result<()> {
        let mut failures = Vec::new();
        for worker in self.workers {
            match worker.join.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(format!("{}: {:#}", worker.name, err)),
                Err(_) => failures.push(format!("{}: thread panicked", worker.name)),
            }
        }
        if failures.is_empty() {
            log::info!("pipeline stopped");
            return Ok(());
        }
        Err(anyhow!(
            "{} pipeline stage(s) failed: {}",
            failures.len(),
            failures.join("; ")
        ))
    }
}
