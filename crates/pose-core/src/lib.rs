//! Pose estimation core: device selection, the pluggable pose backend, the
//! normalizing estimator, and the fall-risk scorer.
//!
//! The crate deliberately knows nothing about HTTP or video containers. It
//! consumes decoded RGB images and produces canonical [`PersonPose`] records
//! in source-frame pixel coordinates, ready for scoring or drawing.

pub use backend::{
    DetectorModel, KeypointRcnn, LibraryModel, PoseBackend, RawDetections, ScriptedPoseLibrary,
};
pub use device::{describe, select_device, DeviceInfo, DeviceKind};
pub use estimator::{EstimatorOptions, PoseEstimator, DEFAULT_MAX_SIDE, DEFAULT_SCORE_THRESHOLD};
pub use fall::FallDetector;
pub use types::{FallAssessment, Keypoint, KeypointName, PersonPose};

mod backend;
mod device;
mod estimator;
mod fall;
mod types;
