//! Wire types shared by the HTTP handlers.

use pose_core::{DeviceInfo, PersonPose};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub(crate) struct FrameAnalyzeRequest {
    /// Raw base64 or a `data:` URL.
    pub(crate) image_base64: String,
    pub(crate) preferred_device: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct FrameAnalyzeResponse {
    pub(crate) device: DeviceInfo,
    pub(crate) people: Vec<PersonPose>,
    pub(crate) is_fall: bool,
    pub(crate) fall_score: f32,
}

#[derive(Serialize)]
pub(crate) struct VideoAnalyzeResponse {
    pub(crate) device: DeviceInfo,
    pub(crate) analyzed_frames: u64,
    pub(crate) any_fall: bool,
    pub(crate) fall_frames: Vec<u64>,
    pub(crate) average_fall_score: f32,
}

#[derive(Serialize)]
pub(crate) struct SubmitResponse {
    pub(crate) job_id: String,
}

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
    pub(crate) device: DeviceInfo,
}

#[derive(Deserialize, Default)]
pub(crate) struct UploadQuery {
    pub(crate) filename: Option<String>,
    pub(crate) preferred_device: Option<String>,
}
