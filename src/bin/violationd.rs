//! violationd - violation pipeline daemon
//!
//! This daemon:
//! 1. Loads the rule and pipeline configuration
//! 2. Builds the stage graph from the configured topology
//! 3. Runs every stage on its own thread until Ctrl-C or a fatal stage error

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use violation_pipeline::{stages, PipelineConfig, PipelineHost, Router, ShutdownSignal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Deduplicate detections into safety-violation alerts")]
struct Args {
    /// Pipeline configuration file (TOML when it ends in .toml, JSON otherwise).
    #[arg(long, env = "VAP_CONFIG")]
    config: Option<PathBuf>,

    /// Audit every batch, not only violations.
    #[arg(long)]
    log_all: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = PipelineConfig::load_from(args.config.as_deref())
        .context("load pipeline configuration")?;
    if args.log_all {
        cfg.audit.log_all = true;
    }
    for (stage, downstream) in &cfg.topology {
        log::info!("stage {} -> [{}]", stage, downstream.join(", "));
    }
    if args.check {
        log::info!("configuration ok");
        return Ok(());
    }

    let rules = Arc::new(cfg.rules.clone());
    let router = Router::from_topology(&cfg.topology)?;
    let names: Vec<String> = router.stage_names().map(str::to_string).collect();
    let mut host = PipelineHost::new(router);
    for name in &names {
        let stage = stages::build_stage(name, &cfg, rules.clone())
            .with_context(|| format!("build stage {}", name))?;
        host.register(stage)?;
    }

    let shutdown = ShutdownSignal::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        on_signal.trigger();
    })
    .context("error setting Ctrl-C handler")?;

    let handle = host.start(shutdown)?;
    log::info!("violationd running {} stage(s); Ctrl-C to stop", names.len());
    handle.join()?;
    log::info!("violationd stopped");
    Ok(())
}
