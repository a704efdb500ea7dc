//! Annotation workers: one thread per asynchronous video job.
//!
//! The worker is the terminal point of its thread; every failure is caught
//! here and converted into a job-state error. Nothing unwinds past the
//! spawn boundary.

use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{Context, Result};
use pose_core::PoseEstimator;
use tracing::{debug, error};
use video_io::{TempVideo, VideoReader, VideoSink};

use crate::service::{
    draw,
    jobs::{JobRegistry, WorkerSet},
};

pub(crate) const STOPPING_MESSAGE: &str = "server stopping";

/// Outcome of one pass over a container.
pub(crate) struct AnnotateOutcome {
    pub(crate) processed: u64,
    pub(crate) stopped: bool,
}

/// Decode, estimate, overlay, and re-encode frames in source order until the
/// container ends or the stop flag is raised. The stop flag is checked before
/// every frame, so cancellation latency is bounded by one frame's work.
pub(crate) fn annotate_stream(
    reader: &mut VideoReader,
    sink: &mut VideoSink,
    estimator: &PoseEstimator,
    stop: &AtomicBool,
    mut on_progress: impl FnMut(u64),
) -> Result<AnnotateOutcome> {
    let mut processed = 0u64;
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(AnnotateOutcome {
                processed,
                stopped: true,
            });
        }
        let Some(mut frame) = reader.read().context("frame decode failed")? else {
            break;
        };
        let image = draw::frame_to_rgb(&frame)
            .ok_or_else(|| anyhow::anyhow!("decoded frame has inconsistent geometry"))?;
        let people = estimator.estimate(&image)?;
        draw::draw_skeleton(&mut frame, &people);
        sink.write(&frame).context("frame encode failed")?;
        processed += 1;
        metrics::counter!("fallwatch_frames_annotated_total").increment(1);
        on_progress(processed);
    }
    Ok(AnnotateOutcome {
        processed,
        stopped: false,
    })
}

/// Spawn the worker thread for one registered job and track it for
/// join-on-shutdown.
pub(crate) fn spawn_annotate_worker(
    registry: Arc<JobRegistry>,
    workers: &WorkerSet,
    stop: Arc<AtomicBool>,
    estimator: Arc<PoseEstimator>,
    job_id: String,
    video_bytes: Vec<u8>,
    progress_batch: u64,
) -> Result<()> {
    let thread_name = format!("annotate-{}", &job_id[..job_id.len().min(8)]);
    let handle = thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                run_annotate_job(
                    &registry,
                    &stop,
                    &estimator,
                    &job_id,
                    &video_bytes,
                    progress_batch,
                )
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(job = %job_id, "annotate worker error: {err:#}");
                    registry.fail(&job_id, err.to_string());
                }
                Err(_) => {
                    error!(job = %job_id, "annotate worker panicked");
                    registry.fail(&job_id, "internal worker failure");
                }
            }
        })
        .context("failed to spawn annotate worker")?;
    workers.track(handle);
    Ok(())
}

fn run_annotate_job(
    registry: &JobRegistry,
    stop: &AtomicBool,
    estimator: &PoseEstimator,
    job_id: &str,
    video_bytes: &[u8],
    progress_batch: u64,
) -> Result<()> {
    let staged = TempVideo::from_bytes(video_bytes)?;
    let mut reader = match VideoReader::open(staged.path()) {
        Ok(reader) => reader,
        Err(err) => {
            registry.fail(job_id, "failed to read video");
            debug!(job = %job_id, "container open failed: {err}");
            return Ok(());
        }
    };
    let meta = reader.meta()?;
    registry.set_total(job_id, meta.frame_count);

    let output_path = persistent_output_path(job_id)?;
    let mut sink = VideoSink::create(&output_path, meta.fps, meta.width, meta.height)?;

    let batch = progress_batch.max(1);
    let outcome = annotate_stream(&mut reader, &mut sink, estimator, stop, |processed| {
        if processed % batch == 0 {
            registry.set_progress(job_id, processed);
        }
    });
    sink.release()?;

    match outcome {
        Ok(outcome) if outcome.stopped => {
            debug!(job = %job_id, "annotate worker interrupted by stop flag");
            registry.fail(job_id, STOPPING_MESSAGE);
            let _ = std::fs::remove_file(&output_path);
        }
        Ok(outcome) => {
            registry.set_progress(job_id, outcome.processed);
            registry.finish(job_id, output_path);
            debug!(job = %job_id, frames = outcome.processed, "annotate worker finished");
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

/// Output artifact location for one job. The file outlives the worker so the
/// result endpoint can serve it; nothing reclaims it later (see the
/// retention note on [`JobRegistry`]).
fn persistent_output_path(job_id: &str) -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("fallwatch-")
        .suffix(&format!("-{job_id}.mp4"))
        .tempfile()
        .context("failed to allocate output file")?;
    let path = file
        .into_temp_path()
        .keep()
        .context("failed to persist output file")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_paths_are_unique_and_persistent() {
        let a = persistent_output_path("job-a").unwrap();
        let b = persistent_output_path("job-b").unwrap();
        assert_ne!(a, b);
        assert!(a.exists());
        std::fs::remove_file(&a).unwrap();
        std::fs::remove_file(&b).unwrap();
    }

    #[test]
    fn malformed_video_fails_the_job_without_unwinding() {
        let registry = Arc::new(JobRegistry::new());
        let workers = WorkerSet::new();
        let stop = Arc::new(AtomicBool::new(false));
        let estimator = Arc::new(test_estimator());
        let job_id = registry.create("broken.mp4", None);

        spawn_annotate_worker(
            registry.clone(),
            &workers,
            stop,
            estimator,
            job_id.clone(),
            b"definitely not a container".to_vec(),
            5,
        )
        .unwrap();
        assert_eq!(workers.join_with_timeout(std::time::Duration::from_secs(10)), 0);

        let progress = registry.progress(&job_id).unwrap();
        assert_eq!(progress.status, crate::service::jobs::JobStatus::Error);
        assert_eq!(progress.error.as_deref(), Some("failed to read video"));
    }

    #[test]
    fn stop_mid_job_errors_and_removes_partial_output() {
        use crate::service::jobs::{JobQueryError, JobStatus};

        // Raises the stop flag while the first frame is in flight, the way
        // shutdown would interleave with a running job.
        struct StopRaiser {
            stop: Arc<AtomicBool>,
        }
        impl pose_core::DetectorModel for StopRaiser {
            fn infer(&self, _image: &image::RgbImage) -> Result<pose_core::RawDetections> {
                self.stop.store(true, Ordering::SeqCst);
                Ok(pose_core::RawDetections::default())
            }
        }

        let registry = Arc::new(JobRegistry::new());
        let workers = WorkerSet::new();
        let stop = Arc::new(AtomicBool::new(false));
        let estimator = Arc::new(PoseEstimator::with_backend(
            pose_core::PoseBackend::Detector(Box::new(StopRaiser { stop: stop.clone() })),
            pose_core::DeviceKind::Cpu,
            pose_core::DEFAULT_SCORE_THRESHOLD,
            pose_core::DEFAULT_MAX_SIDE,
        ));
        let job_id = registry.create("clip.mp4", Some(6));

        spawn_annotate_worker(
            registry.clone(),
            &workers,
            stop,
            estimator,
            job_id.clone(),
            sample_video(6),
            1,
        )
        .unwrap();
        assert_eq!(
            workers.join_with_timeout(std::time::Duration::from_secs(30)),
            0
        );

        // At most one frame was processed before the flag took effect.
        let progress = registry.progress(&job_id).unwrap();
        assert_eq!(progress.status, JobStatus::Error);
        assert_eq!(progress.error.as_deref(), Some(STOPPING_MESSAGE));
        assert!(progress.processed <= 1);
        assert_eq!(registry.result(&job_id), Err(JobQueryError::NotReady));

        let leftover = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy().contains(&job_id));
        assert!(!leftover, "partial output artifact was not removed");
    }

    fn test_estimator() -> PoseEstimator {
        struct NoDetections;
        impl pose_core::DetectorModel for NoDetections {
            fn infer(&self, _image: &image::RgbImage) -> Result<pose_core::RawDetections> {
                Ok(pose_core::RawDetections::default())
            }
        }
        PoseEstimator::with_backend(
            pose_core::PoseBackend::Detector(Box::new(NoDetections)),
            pose_core::DeviceKind::Cpu,
            pose_core::DEFAULT_SCORE_THRESHOLD,
            pose_core::DEFAULT_MAX_SIDE,
        )
    }

    fn sample_video(frames: usize) -> Vec<u8> {
        let file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        let mut sink = VideoSink::create(file.path(), 10.0, 32, 32).unwrap();
        let frame = video_io::Frame {
            data: vec![0u8; 32 * 32 * 3],
            width: 32,
            height: 32,
            format: video_io::FrameFormat::Bgr8,
        };
        for _ in 0..frames {
            sink.write(&frame).unwrap();
        }
        sink.release().unwrap();
        std::fs::read(file.path()).unwrap()
    }
}
