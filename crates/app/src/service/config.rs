use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use pose_core::{DEFAULT_MAX_SIDE, DEFAULT_SCORE_THRESHOLD};

pub(crate) const SERVE_USAGE: &str = "Usage: fallwatch [serve] --model <path> \
[--library-model <path>] [--bind <addr>] [--port <port>] [--device <mps|cuda|cpu>] \
[--score-threshold <0..1>] [--max-side <px>] [--stride <n>] [--progress-batch <n>] \
[--shutdown-timeout <secs>]\n\nThe PREFERRED_DEVICE environment variable supplies \
--device when the flag is absent.";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
    pub detector_model: PathBuf,
    pub library_model: Option<PathBuf>,
    pub preferred_device: Option<String>,
    pub score_threshold: f32,
    pub max_side: u32,
    /// Synchronous scans analyze every `frame_stride`-th frame.
    pub frame_stride: u64,
    /// Workers publish progress every `progress_batch` frames.
    pub progress_batch: u64,
    pub shutdown_timeout: Duration,
}

impl ServeConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut bind: Option<String> = None;
        let mut port: Option<u16> = None;
        let mut detector_model: Option<PathBuf> = None;
        let mut library_model: Option<PathBuf> = None;
        let mut preferred_device: Option<String> = None;
        let mut score_threshold: Option<f32> = None;
        let mut max_side: Option<u32> = None;
        let mut frame_stride: Option<u64> = None;
        let mut progress_batch: Option<u64> = None;
        let mut shutdown_timeout: Option<u64> = None;

        let mut idx = 1;
        if args.get(idx).map(|s| s.as_str()) == Some("serve") {
            idx += 1;
        }
        while idx < args.len() {
            match args[idx].as_str() {
                "--bind" => {
                    idx += 1;
                    bind = Some(flag_value(args, idx, "--bind")?.to_string());
                    idx += 1;
                }
                "--port" => {
                    idx += 1;
                    port = Some(
                        flag_value(args, idx, "--port")?
                            .parse::<u16>()
                            .with_context(|| "--port must be a port number".to_string())?,
                    );
                    idx += 1;
                }
                "--model" => {
                    idx += 1;
                    detector_model = Some(PathBuf::from(flag_value(args, idx, "--model")?));
                    idx += 1;
                }
                "--library-model" => {
                    idx += 1;
                    library_model = Some(PathBuf::from(flag_value(args, idx, "--library-model")?));
                    idx += 1;
                }
                "--device" => {
                    idx += 1;
                    preferred_device = Some(flag_value(args, idx, "--device")?.to_string());
                    idx += 1;
                }
                "--score-threshold" => {
                    idx += 1;
                    let value = flag_value(args, idx, "--score-threshold")?
                        .parse::<f32>()
                        .with_context(|| "--score-threshold must be a number".to_string())?;
                    if !(0.0..=1.0).contains(&value) {
                        bail!("--score-threshold must be between 0 and 1");
                    }
                    score_threshold = Some(value);
                    idx += 1;
                }
                "--max-side" => {
                    idx += 1;
                    let value = flag_value(args, idx, "--max-side")?
                        .parse::<u32>()
                        .with_context(|| "--max-side must be a positive integer".to_string())?;
                    if value == 0 {
                        bail!("--max-side must be a positive integer");
                    }
                    max_side = Some(value);
                    idx += 1;
                }
                "--stride" => {
                    idx += 1;
                    let value = flag_value(args, idx, "--stride")?
                        .parse::<u64>()
                        .with_context(|| "--stride must be a positive integer".to_string())?;
                    if value == 0 {
                        bail!("--stride must be at least 1");
                    }
                    frame_stride = Some(value);
                    idx += 1;
                }
                "--progress-batch" => {
                    idx += 1;
                    let value = flag_value(args, idx, "--progress-batch")?
                        .parse::<u64>()
                        .with_context(|| "--progress-batch must be a positive integer".to_string())?;
                    if value == 0 {
                        bail!("--progress-batch must be at least 1");
                    }
                    progress_batch = Some(value);
                    idx += 1;
                }
                "--shutdown-timeout" => {
                    idx += 1;
                    shutdown_timeout = Some(
                        flag_value(args, idx, "--shutdown-timeout")?
                            .parse::<u64>()
                            .with_context(|| "--shutdown-timeout must be seconds".to_string())?,
                    );
                    idx += 1;
                }
                arg => {
                    bail!("Unrecognised argument: {arg}\n\n{SERVE_USAGE}");
                }
            }
        }

        let detector_model = detector_model
            .ok_or_else(|| anyhow!("Missing pose model. Provide --model <path>.\n\n{SERVE_USAGE}"))?;
        let preferred_device = preferred_device
            .or_else(|| std::env::var("PREFERRED_DEVICE").ok().filter(|v| !v.is_empty()));

        Ok(Self {
            bind: bind.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: port.unwrap_or(8000),
            detector_model,
            library_model,
            preferred_device,
            score_threshold: score_threshold.unwrap_or(DEFAULT_SCORE_THRESHOLD),
            max_side: max_side.unwrap_or(DEFAULT_MAX_SIDE),
            frame_stride: frame_stride.unwrap_or(3),
            progress_batch: progress_batch.unwrap_or(5),
            shutdown_timeout: Duration::from_secs(shutdown_timeout.unwrap_or(5)),
        })
    }
}

fn flag_value<'a>(args: &'a [String], idx: usize, flag: &str) -> Result<&'a str> {
    args.get(idx)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow!("{flag} requires a value"))
}
