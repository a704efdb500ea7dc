//! Pose normalizer: wraps one [`PoseBackend`] and converts its raw output
//! into canonical [`PersonPose`] records in source-frame coordinates.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use tch::Device;
use tracing::debug;

use crate::backend::{KeypointRcnn, PoseBackend, RawDetections};
use crate::device::{describe, select_device, DeviceInfo, DeviceKind};
use crate::types::{Keypoint, KeypointName, PersonPose};

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_SIDE: u32 = 640;

/// Construction options for [`PoseEstimator::new`].
#[derive(Debug, Clone)]
pub struct EstimatorOptions {
    pub detector_model: PathBuf,
    pub library_model: Option<PathBuf>,
    pub preferred_device: Option<String>,
    pub score_threshold: f32,
    pub max_side: u32,
}

/// Wraps exactly one pose backend, selected at construction and safe for
/// concurrent use across requests. Inference calls are serialized through an
/// internal mutex: the underlying engine is treated as single-call-at-a-time.
pub struct PoseEstimator {
    backend: Mutex<PoseBackend>,
    kind: DeviceKind,
    score_threshold: f32,
    max_side: u32,
}

impl PoseEstimator {
    /// Build an estimator for the resolved device kind. A library model is
    /// preferred when configured and loadable; otherwise the generic keypoint
    /// detector is loaded.
    ///
    /// Detection models are known to be unstable on MPS, so the detector path
    /// routes inference to CPU while the reported device identity stays MPS.
    pub fn new(options: &EstimatorOptions) -> Result<Self> {
        let (device, kind) = select_device(options.preferred_device.as_deref());

        if let Some(path) = &options.library_model {
            match crate::backend::ScriptedPoseLibrary::load(path, device) {
                Ok(model) => {
                    debug!(device = kind.as_str(), "using library pose backend");
                    return Ok(Self::with_backend(
                        PoseBackend::Library(Box::new(model)),
                        kind,
                        options.score_threshold,
                        options.max_side,
                    ));
                }
                Err(err) => {
                    debug!("library backend unavailable, falling back to detector: {err:#}");
                }
            }
        }

        let inference_device = if kind == DeviceKind::Mps {
            debug!("routing detector inference to CPU due to MPS incompatibilities");
            Device::Cpu
        } else {
            device
        };
        let detector = KeypointRcnn::load(&options.detector_model, inference_device)
            .context("no usable pose backend")?;
        debug!(device = kind.as_str(), "using detector pose backend");
        Ok(Self::with_backend(
            PoseBackend::Detector(Box::new(detector)),
            kind,
            options.score_threshold,
            options.max_side,
        ))
    }

    /// Wrap an already-constructed backend. Used by tests and by callers that
    /// manage model loading themselves.
    pub fn with_backend(
        backend: PoseBackend,
        kind: DeviceKind,
        score_threshold: f32,
        max_side: u32,
    ) -> Self {
        Self {
            backend: Mutex::new(backend),
            kind,
            score_threshold,
            max_side: max_side.max(1),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn device_info(&self) -> DeviceInfo {
        describe(self.kind)
    }

    /// Estimate poses for one RGB image. Absence of detections is a valid
    /// outcome and yields an empty list.
    pub fn estimate(&self, image: &RgbImage) -> Result<Vec<PersonPose>> {
        let backend = self
            .backend
            .lock()
            .map_err(|_| anyhow::anyhow!("pose backend poisoned"))?;
        match &*backend {
            PoseBackend::Library(model) => {
                let mut people = model.predict(image)?;
                for person in &mut people {
                    person.score = person.score.clamp(0.0, 1.0);
                    for kp in &mut person.keypoints {
                        kp.score = kp.score.clamp(0.0, 1.0);
                    }
                }
                debug!(people = people.len(), "library backend detections");
                Ok(people)
            }
            PoseBackend::Detector(model) => {
                let (resized, scale) = resize_for_inference(image, self.max_side);
                let raw = match &resized {
                    Some(small) => model.infer(small)?,
                    None => model.infer(image)?,
                };
                Ok(self.normalize_detections(raw, scale))
            }
        }
    }

    /// Convert raw detector output into canonical people: filter by
    /// detection score, rescale back to source coordinates, name keypoints
    /// by output index, and normalize keypoint scores into `[0, 1]`.
    fn normalize_detections(&self, raw: RawDetections, scale: f32) -> Vec<PersonPose> {
        if raw.is_empty() {
            debug!("no detections from detector backend");
            return Vec::new();
        }

        let inv_scale = if scale != 0.0 { 1.0 / scale } else { 1.0 };
        let count = raw.scores.len().min(raw.boxes.len()).min(raw.keypoints.len());
        let mut people = Vec::new();
        for i in 0..count {
            let score = raw.scores[i];
            if score < self.score_threshold {
                continue;
            }
            let b = raw.boxes[i];
            let bbox = [
                b[0] * inv_scale,
                b[1] * inv_scale,
                b[2] * inv_scale,
                b[3] * inv_scale,
            ];
            let keypoints = raw.keypoints[i]
                .iter()
                .enumerate()
                .map(|(j, &[x, y, v])| {
                    let kp_score = match raw.keypoint_scores.as_ref().and_then(|ks| {
                        ks.get(i).and_then(|person| person.get(j)).copied()
                    }) {
                        Some(raw_score) => normalize_kp_score(raw_score, true),
                        None => normalize_kp_score(v, false),
                    };
                    Keypoint::new(
                        x * inv_scale,
                        y * inv_scale,
                        kp_score,
                        KeypointName::from_index(j),
                    )
                })
                .collect();
            people.push(PersonPose {
                keypoints,
                score: score.clamp(0.0, 1.0),
                bbox: Some(bbox),
            });
        }
        debug!(people = people.len(), "detector backend detections kept");
        people
    }
}

/// Downscale so the longer side does not exceed `max_side`, preserving
/// aspect ratio. Returns the resized image (when needed) and the applied
/// scale factor.
fn resize_for_inference(image: &RgbImage, max_side: u32) -> (Option<RgbImage>, f32) {
    let (w, h) = image.dimensions();
    let max_wh = w.max(h);
    if max_wh <= max_side || max_wh == 0 {
        return (None, 1.0);
    }
    let scale = max_side as f32 / max_wh as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    debug!("resized image from {w}x{h} to {new_w}x{new_h} for inference");
    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);
    (Some(resized), scale)
}

/// Normalize a backend-native keypoint score into `[0, 1]`.
///
/// Heatmap-derived score tensors can exceed the unit interval and get a
/// logistic squash; small integer visibility flags are divided by 2 and
/// clamped. The two encodings are not comparable on a shared scale, so both
/// paths are kept distinct even though the range check can misclassify
/// near-boundary values.
pub(crate) fn normalize_kp_score(value: f32, from_score_tensor: bool) -> f32 {
    let score = if from_score_tensor {
        if !(0.0..=1.0).contains(&value) {
            1.0 / (1.0 + (-value).exp())
        } else {
            value
        }
    } else {
        (value / 2.0).clamp(0.0, 1.0)
    };
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DetectorModel, LibraryModel};

    struct FakeDetector {
        raw: RawDetections,
    }

    impl DetectorModel for FakeDetector {
        fn infer(&self, _image: &RgbImage) -> Result<RawDetections> {
            Ok(self.raw.clone())
        }
    }

    struct FakeLibrary {
        people: Vec<PersonPose>,
    }

    impl LibraryModel for FakeLibrary {
        fn predict(&self, _image: &RgbImage) -> Result<Vec<PersonPose>> {
            Ok(self.people.clone())
        }
    }

    fn detector_estimator(raw: RawDetections) -> PoseEstimator {
        PoseEstimator::with_backend(
            PoseBackend::Detector(Box::new(FakeDetector { raw })),
            DeviceKind::Cpu,
            DEFAULT_SCORE_THRESHOLD,
            DEFAULT_MAX_SIDE,
        )
    }

    fn one_person(keypoint: [f32; 3], score: f32) -> RawDetections {
        RawDetections {
            boxes: vec![[10.0, 20.0, 110.0, 220.0]],
            scores: vec![score],
            keypoints: vec![vec![keypoint]],
            keypoint_scores: None,
        }
    }

    #[test]
    fn normalization_keeps_scores_in_unit_interval() {
        // Property over both paths, including far out-of-range raw inputs.
        let mut raw = -25.0f32;
        while raw <= 25.0 {
            for from_score_tensor in [true, false] {
                let score = normalize_kp_score(raw, from_score_tensor);
                assert!((0.0..=1.0).contains(&score), "raw={raw} score={score}");
            }
            raw += 0.37;
        }
    }

    #[test]
    fn score_tensor_path_squashes_only_out_of_range_values() {
        assert_eq!(normalize_kp_score(0.4, true), 0.4);
        let squashed = normalize_kp_score(3.0, true);
        assert!((squashed - 1.0 / (1.0 + (-3.0f32).exp())).abs() < 1e-6);
    }

    #[test]
    fn visibility_path_halves_and_clamps() {
        assert_eq!(normalize_kp_score(2.0, false), 1.0);
        assert_eq!(normalize_kp_score(1.0, false), 0.5);
        assert_eq!(normalize_kp_score(-1.0, false), 0.0);
        assert_eq!(normalize_kp_score(7.0, false), 1.0);
    }

    #[test]
    fn rescaling_round_trips_within_tolerance() {
        // 1280x960 downscales by 0.5; detector coordinates come back in
        // resized space and must map onto the original frame.
        let estimator = detector_estimator(one_person([100.0, 50.0, 2.0], 0.9));
        let image = RgbImage::new(1280, 960);
        let people = estimator.estimate(&image).unwrap();
        assert_eq!(people.len(), 1);
        let kp = people[0].keypoints[0];
        assert!((kp.x - 200.0).abs() < 1e-3);
        assert!((kp.y - 100.0).abs() < 1e-3);
        let bbox = people[0].bbox.unwrap();
        assert!((bbox[0] - 20.0).abs() < 1e-3);
        assert!((bbox[3] - 440.0).abs() < 1e-3);
    }

    #[test]
    fn small_images_skip_resizing() {
        let (resized, scale) = resize_for_inference(&RgbImage::new(640, 480), 640);
        assert!(resized.is_none());
        assert_eq!(scale, 1.0);

        let (resized, scale) = resize_for_inference(&RgbImage::new(1920, 1080), 640);
        let resized = resized.unwrap();
        assert_eq!(resized.dimensions().0, 640);
        assert!((scale - 640.0 / 1920.0).abs() < 1e-6);
    }

    #[test]
    fn low_confidence_detections_are_dropped() {
        let raw = RawDetections {
            boxes: vec![[0.0, 0.0, 10.0, 10.0], [0.0, 0.0, 10.0, 10.0]],
            scores: vec![0.9, 0.3],
            keypoints: vec![vec![[1.0, 1.0, 2.0]], vec![[1.0, 1.0, 2.0]]],
            keypoint_scores: None,
        };
        let estimator = detector_estimator(raw);
        let people = estimator.estimate(&RgbImage::new(64, 64)).unwrap();
        assert_eq!(people.len(), 1);
        assert!((people[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn keypoints_are_named_by_output_index() {
        let keypoints: Vec<[f32; 3]> = (0..18).map(|i| [i as f32, i as f32, 2.0]).collect();
        let raw = RawDetections {
            boxes: vec![[0.0, 0.0, 10.0, 10.0]],
            scores: vec![0.8],
            keypoints: vec![keypoints],
            keypoint_scores: None,
        };
        let estimator = detector_estimator(raw);
        let people = estimator.estimate(&RgbImage::new(64, 64)).unwrap();
        let kps = &people[0].keypoints;
        assert_eq!(kps[0].name, Some(KeypointName::Nose));
        assert_eq!(kps[16].name, Some(KeypointName::RightAnkle));
        assert_eq!(kps[17].name, None);
    }

    #[test]
    fn empty_backend_output_is_not_an_error() {
        let estimator = detector_estimator(RawDetections::default());
        let people = estimator.estimate(&RgbImage::new(64, 64)).unwrap();
        assert!(people.is_empty());
    }

    #[test]
    fn library_backend_passes_through_with_clamped_scores() {
        let people = vec![PersonPose {
            keypoints: vec![Keypoint {
                x: 5.0,
                y: 6.0,
                score: 1.7,
                name: Some(KeypointName::Nose),
            }],
            score: 2.3,
            bbox: Some([1.0, 2.0, 3.0, 4.0]),
        }];
        let estimator = PoseEstimator::with_backend(
            PoseBackend::Library(Box::new(FakeLibrary { people })),
            DeviceKind::Cpu,
            DEFAULT_SCORE_THRESHOLD,
            DEFAULT_MAX_SIDE,
        );
        let people = estimator.estimate(&RgbImage::new(64, 64)).unwrap();
        assert_eq!(people[0].score, 1.0);
        assert_eq!(people[0].keypoints[0].score, 1.0);
        assert_eq!(people[0].bbox, Some([1.0, 2.0, 3.0, 4.0]));
    }
}
