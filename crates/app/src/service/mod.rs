//! Fall-detection API service: pose estimation over HTTP with synchronous
//! analysis endpoints and an asynchronous video-annotation job subsystem.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `engine`: Estimator cache, fall scoring, and job submission.
//! - `server`: Actix Web API endpoints.
//! - `worker`: Per-job annotation threads.
//! - `jobs`: Job registry and worker tracking.
//! - `draw`: Skeleton overlay drawing on raw frames.
//! - `telemetry`: Tracing and Prometheus plumbing.
//! - `error`: Error taxonomy and HTTP status mapping.
//! - `data`: Wire structs for the HTTP surface.

pub use config::ServeConfig;
pub(crate) use config::SERVE_USAGE;
pub(crate) use telemetry::init_tracing;

mod config;
mod data;
mod draw;
mod engine;
mod error;
mod jobs;
mod server;
mod telemetry;
mod worker;

use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{info, warn};

use engine::Engine;

/// Run the service until Ctrl-C or a fatal server error.
pub fn run(config: ServeConfig) -> Result<()> {
    telemetry::init_metrics_recorder();

    let engine = Arc::new(Engine::new(config.clone()));
    engine.warm_up().context("failed to initialise pose backend")?;

    let server = server::spawn_api_server(engine.clone(), config.bind.clone(), config.port)?;
    info!(bind = %config.bind, port = config.port, "API server listening");

    let stop = engine.stop_flag();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    while !stop.load(Ordering::Relaxed) && !server.is_finished() {
        thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    server.stop();
    let abandoned = engine.shutdown();
    if abandoned > 0 {
        warn!(abandoned, "annotation workers did not finish before the deadline");
    }
    Ok(())
}
