//! Stage wiring and scheduling.
//!
//! A [`Router`] turns a declarative [`Topology`] into channels; a
//! [`PipelineHost`] runs one thread per stage over them. Stages only see
//! their own [`StageIo`], never their neighbours.
//!
//! Host lifecycle: `Stopped -> Running` on [`PipelineHost::start`],
//! `Running -> Draining` once the [`ShutdownSignal`] fires (stages finish the
//! unit in hand and stop reading), `Draining -> Stopped` when every stage
//! thread has exited. Stages are never restarted.

mod host;
mod router;
mod shutdown;

pub use host::{HostState, PipelineHandle, PipelineHost, Processor, ProcessorStage, Stage};
pub use router::{Router, StageIo, Topology};
pub use shutdown::{ShutdownSignal, POLL_INTERVAL};
