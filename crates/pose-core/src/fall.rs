//! Fall-risk scoring over canonical poses. Pure and stateless: every call
//! recomputes from the supplied people, no history is kept.

use crate::types::{FallAssessment, Keypoint, KeypointName, PersonPose};

const ANGLE_FLOOR_DEG: f32 = 20.0;
const ANGLE_CEIL_DEG: f32 = 90.0;
const ASPECT_FLOOR: f32 = 0.8;
const ASPECT_CEIL: f32 = 2.0;
const FALL_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone, Copy, Default)]
pub struct FallDetector;

impl FallDetector {
    pub fn new() -> Self {
        Self
    }

    /// Torso angle from vertical in degrees: 0 = upright, 90 = horizontal.
    /// Requires both shoulders and both hips; otherwise the term is skipped.
    fn torso_angle_deg(person: &PersonPose) -> Option<f32> {
        let ls = person.keypoint(KeypointName::LeftShoulder)?;
        let rs = person.keypoint(KeypointName::RightShoulder)?;
        let lh = person.keypoint(KeypointName::LeftHip)?;
        let rh = person.keypoint(KeypointName::RightHip)?;
        let (sx, sy) = midpoint(ls, rs);
        let (hx, hy) = midpoint(lh, rh);
        let (dx, dy) = (sx - hx, sy - hy);
        Some(dx.atan2(dy).abs().to_degrees())
    }

    /// Width/height of the bbox, each side floored at one pixel to avoid
    /// division issues. A horizontal box (w > h) suggests a fall.
    fn aspect_ratio(person: &PersonPose) -> Option<f32> {
        let [x1, y1, x2, y2] = person.bbox?;
        let w = (x2 - x1).max(1.0);
        let h = (y2 - y1).max(1.0);
        Some(w / h)
    }

    /// Per-person fall-risk score in `[0, 1]`. Either signal alone can
    /// indicate a fall; low-confidence detections are damped but never
    /// fully zeroed.
    pub fn score_person(&self, person: &PersonPose) -> f32 {
        let mut score = 0.0f32;
        if let Some(angle) = Self::torso_angle_deg(person) {
            let term = ((angle - ANGLE_FLOOR_DEG) / (ANGLE_CEIL_DEG - ANGLE_FLOOR_DEG))
                .clamp(0.0, 1.0);
            score = score.max(term);
        }
        if let Some(ratio) = Self::aspect_ratio(person) {
            let term = ((ratio - ASPECT_FLOOR) / (ASPECT_CEIL - ASPECT_FLOOR)).clamp(0.0, 1.0);
            score = score.max(term);
        }
        score * person.score.clamp(0.5, 1.0)
    }

    /// Frame-level verdict: the maximum per-person score against a fixed
    /// decision threshold. No people means no fall.
    pub fn predict(&self, people: &[PersonPose]) -> FallAssessment {
        if people.is_empty() {
            return FallAssessment {
                is_fall: false,
                fall_score: 0.0,
            };
        }
        let fall_score = people
            .iter()
            .map(|p| self.score_person(p))
            .fold(0.0f32, f32::max);
        FallAssessment {
            is_fall: fall_score >= FALL_THRESHOLD,
            fall_score,
        }
    }
}

fn midpoint(a: &Keypoint, b: &Keypoint) -> (f32, f32) {
    ((a.x + b.x) / 2.0, (a.y + b.y) / 2.0)
}
