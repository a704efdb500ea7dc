use serde::Serialize;

/// COCO 17-keypoint joint vocabulary, ordered by detector output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeypointName {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl KeypointName {
    pub const COUNT: usize = 17;

    /// Map a detector output index onto the joint vocabulary. Indices past
    /// the vocabulary stay unnamed.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Nose),
            1 => Some(Self::LeftEye),
            2 => Some(Self::RightEye),
            3 => Some(Self::LeftEar),
            4 => Some(Self::RightEar),
            5 => Some(Self::LeftShoulder),
            6 => Some(Self::RightShoulder),
            7 => Some(Self::LeftElbow),
            8 => Some(Self::RightElbow),
            9 => Some(Self::LeftWrist),
            10 => Some(Self::RightWrist),
            11 => Some(Self::LeftHip),
            12 => Some(Self::RightHip),
            13 => Some(Self::LeftKnee),
            14 => Some(Self::RightKnee),
            15 => Some(Self::LeftAnkle),
            16 => Some(Self::RightAnkle),
            _ => None,
        }
    }
}

/// Single joint location in original-frame pixel coordinates.
///
/// `score` is always clamped into `[0, 1]` by the estimator, whatever the
/// backend's native score encoding was.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
    pub name: Option<KeypointName>,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, score: f32, name: Option<KeypointName>) -> Self {
        Self {
            x,
            y,
            score: score.clamp(0.0, 1.0),
            name,
        }
    }
}

/// One detected person: keypoints, overall detection confidence, and an
/// optional axis-aligned `[x1, y1, x2, y2]` box in original-frame pixels.
#[derive(Debug, Clone, Serialize)]
pub struct PersonPose {
    pub keypoints: Vec<Keypoint>,
    pub score: f32,
    pub bbox: Option<[f32; 4]>,
}

impl PersonPose {
    /// Look up a keypoint by canonical joint name.
    pub fn keypoint(&self, name: KeypointName) -> Option<&Keypoint> {
        self.keypoints.iter().find(|kp| kp.name == Some(name))
    }
}

/// Frame-level fall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FallAssessment {
    pub is_fall: bool,
    pub fall_score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypoint_name_round_trips_all_indices() {
        for index in 0..KeypointName::COUNT {
            let name = KeypointName::from_index(index).unwrap();
            assert_eq!(name as usize, index);
        }
        assert!(KeypointName::from_index(KeypointName::COUNT).is_none());
    }

    #[test]
    fn keypoint_constructor_clamps_score() {
        assert_eq!(Keypoint::new(0.0, 0.0, 3.5, None).score, 1.0);
        assert_eq!(Keypoint::new(0.0, 0.0, -0.2, None).score, 0.0);
        assert_eq!(Keypoint::new(0.0, 0.0, 0.7, None).score, 0.7);
    }

    #[test]
    fn keypoint_lookup_by_name() {
        let pose = PersonPose {
            keypoints: vec![
                Keypoint::new(1.0, 2.0, 0.9, Some(KeypointName::Nose)),
                Keypoint::new(3.0, 4.0, 0.8, Some(KeypointName::LeftHip)),
            ],
            score: 1.0,
            bbox: None,
        };
        assert_eq!(pose.keypoint(KeypointName::LeftHip).unwrap().x, 3.0);
        assert!(pose.keypoint(KeypointName::RightAnkle).is_none());
    }
}
