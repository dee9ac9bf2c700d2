//! gazed - eye-tracking relay daemon
//!
//! This daemon:
//! 1. Loads the configuration (file from --config / GAZE_CONFIG, then env overrides)
//! 2. Loads every model; a model that fails to load aborts startup
//! 3. Connects every camera; a camera that fails to open aborts startup
//! 4. Runs one capture thread per camera and the tick loop on the main thread
//! 5. On Ctrl-C, finishes the current tick, stops the capture threads, and exits

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gaze_relay::{
    open_source, start_workers, stop_workers, CaptureWorker, FrameSource, GazeConfig,
    InferenceEngine, Pipeline, TelemetryDispatcher, TemporalFilter,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay eye-camera gaze estimates as OSC parameters")]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "GAZE_CONFIG")]
    config: Option<PathBuf>,

    /// Load the configuration and models, then exit.
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = GazeConfig::load_from(args.config.as_deref())?;
    log::info!(
        "gazed {} starting: {} sources, {} models, {} channels, osc -> {}",
        env!("CARGO_PKG_VERSION"),
        cfg.sources.len(),
        cfg.models.len(),
        cfg.total_channels(),
        cfg.telemetry.addr
    );
    for source in &cfg.sources {
        log::info!(
            "source {}: {} ({:?}, {}x{} @ {} fps)",
            source.id,
            source.device,
            source.kind(),
            source.width,
            source.height,
            source.fps
        );
    }

    let engines = cfg
        .models
        .iter()
        .map(InferenceEngine::load)
        .collect::<Result<Vec<_>>>()?;

    if args.check {
        log::info!("configuration ok");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let filter = TemporalFilter::from_groups(cfg.filter_groups());
    let dispatcher =
        TelemetryDispatcher::new(cfg.telemetry.socket_addr()?, cfg.telemetry.routes.clone())?;

    let timeout = cfg.pipeline.shutdown_timeout();
    let sources = cfg.sources.iter().map(|settings| -> Result<Box<dyn FrameSource>> {
        let mut source = open_source(settings, &cfg.serial)?;
        source
            .connect()
            .with_context(|| format!("failed to open camera '{}' ({})", settings.id, settings.device))?;
        Ok(source)
    });
    let workers = start_workers(sources, cfg.pipeline.reconnect_delay(), timeout)?;

    let buffers = workers.iter().map(CaptureWorker::buffer).collect();
    let mut pipeline = match Pipeline::new(buffers, engines, filter, dispatcher, &cfg.pipeline) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            stop_workers(workers, timeout);
            return Err(err);
        }
    };

    pipeline.run(&shutdown, &workers);

    log::info!("shutdown signal received, stopping capture threads...");
    let stopped = stop_workers(workers, timeout);
    log::info!("{} capture threads stopped cleanly", stopped);
    drop(pipeline);

    Ok(())
}
