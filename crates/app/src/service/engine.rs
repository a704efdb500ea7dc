//! Shared service state behind the HTTP handlers.
//!
//! The engine owns one estimator per device kind, the fall detector, the job
//! registry, and the stop flag. Everything here is blocking work; the HTTP
//! layer hops onto a blocking thread before calling in.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::anyhow;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbImage;
use pose_core::{
    describe, select_device, DeviceInfo, DeviceKind, EstimatorOptions, FallDetector, PoseEstimator,
};
use tracing::{debug, info};
use video_io::{probe_total_frames, TempVideo, VideoReader, VideoSink};

use crate::service::{
    config::ServeConfig,
    data::{FrameAnalyzeRequest, FrameAnalyzeResponse, VideoAnalyzeResponse},
    draw,
    error::ServiceError,
    jobs::{JobProgress, JobRegistry, WorkerSet},
    worker,
};

pub(crate) struct Engine {
    config: ServeConfig,
    estimators: Mutex<HashMap<DeviceKind, Arc<PoseEstimator>>>,
    fall: FallDetector,
    registry: Arc<JobRegistry>,
    workers: WorkerSet,
    stop: Arc<AtomicBool>,
}

impl Engine {
    pub(crate) fn new(config: ServeConfig) -> Self {
        Self {
            config,
            estimators: Mutex::new(HashMap::new()),
            fall: FallDetector::new(),
            registry: Arc::new(JobRegistry::new()),
            workers: WorkerSet::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Load the default-device estimator up front. Startup aborts when no
    /// backend can be constructed, instead of failing on the first request.
    pub(crate) fn warm_up(&self) -> anyhow::Result<DeviceKind> {
        let estimator = self
            .estimator_for(None)
            .map_err(|err| anyhow!("{err}"))?;
        info!(device = estimator.kind().as_str(), "pose backend ready");
        Ok(estimator.kind())
    }

    /// Resolve (and memoize) the estimator for a requested device. The model
    /// load happens under the cache lock so concurrent first requests for the
    /// same device share one load.
    pub(crate) fn estimator_for(
        &self,
        preferred: Option<&str>,
    ) -> Result<Arc<PoseEstimator>, ServiceError> {
        let preferred = preferred.or(self.config.preferred_device.as_deref());
        let (_, kind) = select_device(preferred);

        let mut estimators = self
            .estimators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = estimators.get(&kind) {
            return Ok(existing.clone());
        }

        let options = EstimatorOptions {
            detector_model: self.config.detector_model.clone(),
            library_model: self.config.library_model.clone(),
            preferred_device: Some(kind.as_str().to_string()),
            score_threshold: self.config.score_threshold,
            max_side: self.config.max_side,
        };
        let estimator = Arc::new(PoseEstimator::new(&options)?);
        debug!(device = kind.as_str(), "estimator loaded");
        estimators.insert(kind, estimator.clone());
        Ok(estimator)
    }

    /// Device identity for health reporting. Never loads a model.
    pub(crate) fn device_info(&self) -> DeviceInfo {
        let estimators = self
            .estimators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let preferred = self.config.preferred_device.as_deref();
        let (_, kind) = select_device(preferred);
        match estimators.get(&kind) {
            Some(estimator) => estimator.device_info(),
            None => describe(kind),
        }
    }

    pub(crate) fn analyze_frame(
        &self,
        request: FrameAnalyzeRequest,
    ) -> Result<FrameAnalyzeResponse, ServiceError> {
        self.reject_if_stopping()?;
        let estimator = self.estimator_for(request.preferred_device.as_deref())?;
        let image = decode_image_payload(&request.image_base64)?;
        let people = estimator.estimate(&image)?;
        let assessment = self.fall.predict(&people);
        metrics::counter!("fallwatch_frames_analyzed_total").increment(1);
        Ok(FrameAnalyzeResponse {
            device: estimator.device_info(),
            people,
            is_fall: assessment.is_fall,
            fall_score: assessment.fall_score,
        })
    }

    /// Scan a whole container for falls without producing an output video.
    /// Frames are numbered from 1; every `frame_stride`-th frame is
    /// analyzed and reported under that number, the rest are decoded and
    /// dropped so numbering stays aligned with the source.
    pub(crate) fn analyze_video(
        &self,
        bytes: &[u8],
        preferred: Option<&str>,
    ) -> Result<VideoAnalyzeResponse, ServiceError> {
        self.reject_if_stopping()?;
        if bytes.is_empty() {
            return Err(ServiceError::InputDecode("empty video upload".into()));
        }
        let estimator = self.estimator_for(preferred)?;
        let staged = TempVideo::from_bytes(bytes)
            .map_err(|err| ServiceError::Inference(err.into()))?;
        let mut reader = VideoReader::open(staged.path())
            .map_err(|_| ServiceError::InputDecode("failed to read video".into()))?;

        let stride = self.config.frame_stride.max(1);
        let mut frame_idx = 0u64;
        let mut analyzed_frames = 0u64;
        let mut fall_frames = Vec::new();
        let mut score_sum = 0.0f64;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(ServiceError::ServerStopping);
            }
            let Some(frame) = reader.read().map_err(|err| ServiceError::Inference(err.into()))?
            else {
                break;
            };
            frame_idx += 1;
            if frame_idx % stride != 0 {
                continue;
            }
            let image = draw::frame_to_rgb(&frame)
                .ok_or_else(|| ServiceError::Inference(anyhow!("frame geometry mismatch")))?;
            let people = estimator.estimate(&image)?;
            let assessment = self.fall.predict(&people);
            analyzed_frames += 1;
            score_sum += f64::from(assessment.fall_score);
            if assessment.is_fall {
                fall_frames.push(frame_idx);
            }
        }

        let average_fall_score = if analyzed_frames > 0 {
            (score_sum / analyzed_frames as f64) as f32
        } else {
            0.0
        };
        Ok(VideoAnalyzeResponse {
            device: estimator.device_info(),
            analyzed_frames,
            any_fall: !fall_frames.is_empty(),
            fall_frames,
            average_fall_score,
        })
    }

    /// Annotate a container in one blocking call and return the encoded MP4
    /// bytes. The output file lives only as long as the call.
    pub(crate) fn annotate_video_sync(
        &self,
        bytes: &[u8],
        preferred: Option<&str>,
    ) -> Result<Vec<u8>, ServiceError> {
        self.reject_if_stopping()?;
        if bytes.is_empty() {
            return Err(ServiceError::InputDecode("empty video upload".into()));
        }
        let estimator = self.estimator_for(preferred)?;
        let staged = TempVideo::from_bytes(bytes)
            .map_err(|err| ServiceError::Inference(err.into()))?;
        let mut reader = VideoReader::open(staged.path())
            .map_err(|_| ServiceError::InputDecode("failed to read video".into()))?;
        let meta = reader.meta().map_err(|err| ServiceError::Inference(err.into()))?;

        let output = tempfile::Builder::new()
            .prefix("fallwatch-sync-")
            .suffix(".mp4")
            .tempfile()
            .map_err(|err| ServiceError::Inference(err.into()))?;
        let mut sink = VideoSink::create(output.path(), meta.fps, meta.width, meta.height)
            .map_err(|err| ServiceError::Inference(err.into()))?;
        let outcome = worker::annotate_stream(&mut reader, &mut sink, &estimator, &self.stop, |_| {})?;
        sink.release().map_err(|err| ServiceError::Inference(err.into()))?;
        if outcome.stopped {
            return Err(ServiceError::ServerStopping);
        }
        debug!(frames = outcome.processed, "synchronous annotation finished");
        std::fs::read(output.path()).map_err(|err| ServiceError::Inference(err.into()))
    }

    /// Register an asynchronous annotation job and spawn its worker. The
    /// estimator is resolved before the job exists so model failures surface
    /// at submission instead of as a failed job.
    pub(crate) fn submit_annotate(
        &self,
        bytes: Vec<u8>,
        filename: Option<String>,
        preferred: Option<&str>,
    ) -> Result<String, ServiceError> {
        self.reject_if_stopping()?;
        if bytes.is_empty() {
            return Err(ServiceError::InputDecode("empty video upload".into()));
        }
        let estimator = self.estimator_for(preferred)?;
        let total = probe_total_frames(&bytes);
        let source = filename.as_deref().unwrap_or("upload.mp4");
        let job_id = self.registry.create(source, total);
        worker::spawn_annotate_worker(
            self.registry.clone(),
            &self.workers,
            self.stop.clone(),
            estimator,
            job_id.clone(),
            bytes,
            self.config.progress_batch,
        )?;
        Ok(job_id)
    }

    pub(crate) fn progress(&self, job_id: &str) -> Result<JobProgress, ServiceError> {
        Ok(self.registry.progress(job_id)?)
    }

    pub(crate) fn result(&self, job_id: &str) -> Result<(PathBuf, String), ServiceError> {
        Ok(self.registry.result(job_id)?)
    }

    /// Raise the stop flag and wait for workers within the configured
    /// deadline. Returns the number of abandoned workers.
    pub(crate) fn shutdown(&self) -> usize {
        self.stop.store(true, Ordering::SeqCst);
        self.workers.join_with_timeout(self.config.shutdown_timeout)
    }

    fn reject_if_stopping(&self) -> Result<(), ServiceError> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(ServiceError::ServerStopping);
        }
        Ok(())
    }

    #[cfg(test)]
    fn insert_estimator(&self, kind: DeviceKind, estimator: Arc<PoseEstimator>) {
        self.estimators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, estimator);
    }
}

/// Accept both a raw base64 payload and a `data:` URL.
fn decode_image_payload(input: &str) -> Result<RgbImage, ServiceError> {
    let trimmed = input.trim();
    let encoded = match trimmed.split_once("base64,") {
        Some((head, rest)) if head.starts_with("data:") => rest,
        _ => trimmed,
    };
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| ServiceError::InputDecode("invalid base64 image payload".into()))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|_| ServiceError::InputDecode("unsupported or corrupt image".into()))?;
    Ok(image.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use pose_core::{PersonPose, PoseBackend, DEFAULT_MAX_SIDE, DEFAULT_SCORE_THRESHOLD};
    use std::io::Cursor;

    struct OnePerson;
    impl pose_core::LibraryModel for OnePerson {
        fn predict(&self, _image: &RgbImage) -> anyhow::Result<Vec<PersonPose>> {
            Ok(vec![PersonPose {
                keypoints: Vec::new(),
                score: 0.9,
                bbox: Some([0.0, 0.0, 10.0, 10.0]),
            }])
        }
    }

    struct AlwaysFallen;
    impl pose_core::LibraryModel for AlwaysFallen {
        fn predict(&self, _image: &RgbImage) -> anyhow::Result<Vec<PersonPose>> {
            // Wide bbox, full confidence: scores 1.0 on the aspect term.
            Ok(vec![PersonPose {
                keypoints: Vec::new(),
                score: 1.0,
                bbox: Some([0.0, 0.0, 200.0, 100.0]),
            }])
        }
    }

    fn engine_with(model: Box<dyn pose_core::LibraryModel>) -> Engine {
        let config = ServeConfig::from_args(&[
            "fallwatch".to_string(),
            "--model".to_string(),
            "unused.pt".to_string(),
        ])
        .unwrap();
        let engine = Engine::new(config);
        let estimator = PoseEstimator::with_backend(
            PoseBackend::Library(model),
            DeviceKind::Cpu,
            DEFAULT_SCORE_THRESHOLD,
            DEFAULT_MAX_SIDE,
        );
        engine.insert_estimator(DeviceKind::Cpu, Arc::new(estimator));
        engine
    }

    fn test_engine() -> Engine {
        engine_with(Box::new(OnePerson))
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

    fn png_base64() -> String {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, image::Rgb([9, 9, 9])));
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        BASE64.encode(buffer.into_inner())
    }

    #[test]
    fn data_url_prefix_is_stripped() {
        let payload = format!("data:image/png;base64,{}", png_base64());
        assert!(decode_image_payload(&payload).is_ok());
    }

    #[test]
    fn raw_base64_is_accepted() {
        assert!(decode_image_payload(&png_base64()).is_ok());
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let err = decode_image_payload("@@not-base64@@").unwrap_err();
        assert!(matches!(err, ServiceError::InputDecode(_)));
        let err = decode_image_payload(&BASE64.encode(b"not an image")).unwrap_err();
        assert!(matches!(err, ServiceError::InputDecode(_)));
    }

    #[test]
    fn analyze_frame_runs_estimate_and_fall_scoring() {
        let engine = test_engine();
        let response = engine
            .analyze_frame(FrameAnalyzeRequest {
                image_base64: png_base64(),
                preferred_device: Some("cpu".to_string()),
            })
            .unwrap();
        assert_eq!(response.people.len(), 1);
        // No landmarks and no tall bbox, so nothing to flag.
        assert!(!response.is_fall);
    }

    #[test]
    fn requests_after_stop_are_rejected() {
        let engine = test_engine();
        engine.stop_flag().store(true, Ordering::SeqCst);
        let err = engine
            .analyze_frame(FrameAnalyzeRequest {
                image_base64: png_base64(),
                preferred_device: Some("cpu".to_string()),
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::ServerStopping));
    }

    #[test]
    fn video_scan_reports_one_based_every_third_frame() {
        let engine = engine_with(Box::new(AlwaysFallen));
        let response = engine
            .analyze_video(&sample_video(9), Some("cpu"))
            .unwrap();
        assert_eq!(response.analyzed_frames, 3);
        assert_eq!(response.fall_frames, vec![3, 6, 9]);
        assert!(response.any_fall);
        assert!((response.average_fall_score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn submit_rejects_empty_uploads() {
        let engine = test_engine();
        let err = engine
            .submit_annotate(Vec::new(), None, Some("cpu"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::InputDecode(_)));
    }
}
