//! Pose overlay drawing on raw BGR8 frame buffers.

use image::RgbImage;
use pose_core::{KeypointName, PersonPose};
use video_io::Frame;

/// Skeleton connections over the COCO joint vocabulary.
const SKELETON_PAIRS: [(KeypointName, KeypointName); 12] = [
    (KeypointName::LeftShoulder, KeypointName::RightShoulder),
    (KeypointName::LeftHip, KeypointName::RightHip),
    (KeypointName::LeftShoulder, KeypointName::LeftHip),
    (KeypointName::RightShoulder, KeypointName::RightHip),
    (KeypointName::LeftShoulder, KeypointName::LeftElbow),
    (KeypointName::LeftElbow, KeypointName::LeftWrist),
    (KeypointName::RightShoulder, KeypointName::RightElbow),
    (KeypointName::RightElbow, KeypointName::RightWrist),
    (KeypointName::LeftHip, KeypointName::LeftKnee),
    (KeypointName::LeftKnee, KeypointName::LeftAnkle),
    (KeypointName::RightHip, KeypointName::RightKnee),
    (KeypointName::RightKnee, KeypointName::RightAnkle),
];

const SCORE_THRESH: f32 = 0.3;

// Colors in BGR order.
const JOINT_COLOR: [u8; 3] = [0, 255, 136];
const EDGE_COLOR: [u8; 3] = [0, 255, 136];
const BOX_COLOR: [u8; 3] = [0, 170, 255];

/// Convert a BGR8 frame into an `RgbImage` for the estimator.
pub(crate) fn frame_to_rgb(frame: &Frame) -> Option<RgbImage> {
    let pixels = frame.data.len() / 3;
    if pixels != (frame.width.max(0) as usize) * (frame.height.max(0) as usize) {
        return None;
    }
    let mut rgb = Vec::with_capacity(frame.data.len());
    for chunk in frame.data.chunks_exact(3) {
        rgb.push(chunk[2]);
        rgb.push(chunk[1]);
        rgb.push(chunk[0]);
    }
    RgbImage::from_vec(frame.width as u32, frame.height as u32, rgb)
}

/// Draw keypoints, skeleton edges, and bounding boxes for every detected
/// person onto the frame, in place. Joints below the score threshold are
/// skipped.
pub(crate) fn draw_skeleton(frame: &mut Frame, people: &[PersonPose]) {
    let max_dim = frame.width.max(frame.height).max(1);
    let thickness = ((0.004 * max_dim as f32).round() as i32).max(2);
    let radius = ((0.006 * max_dim as f32).round() as i32).max(2);

    for person in people {
        for kp in &person.keypoints {
            if kp.name.is_none() || kp.score < SCORE_THRESH {
                continue;
            }
            fill_disc(frame, kp.x.round() as i32, kp.y.round() as i32, radius, JOINT_COLOR);
        }
        for (a, b) in SKELETON_PAIRS {
            let (Some(ka), Some(kb)) = (person.keypoint(a), person.keypoint(b)) else {
                continue;
            };
            if ka.score < SCORE_THRESH || kb.score < SCORE_THRESH {
                continue;
            }
            draw_line(
                frame,
                ka.x.round() as i32,
                ka.y.round() as i32,
                kb.x.round() as i32,
                kb.y.round() as i32,
                thickness,
                EDGE_COLOR,
            );
        }
        if let Some([x1, y1, x2, y2]) = person.bbox {
            draw_rect(
                frame,
                x1.round() as i32,
                y1.round() as i32,
                x2.round() as i32,
                y2.round() as i32,
                thickness,
                BOX_COLOR,
            );
        }
    }
}

fn put_pixel(frame: &mut Frame, x: i32, y: i32, color: [u8; 3]) {
    if x < 0 || y < 0 || x >= frame.width || y >= frame.height {
        return;
    }
    let offset = ((y * frame.width + x) * 3) as usize;
    if offset + 2 < frame.data.len() {
        frame.data[offset] = color[0];
        frame.data[offset + 1] = color[1];
        frame.data[offset + 2] = color[2];
    }
}

fn fill_disc(frame: &mut Frame, cx: i32, cy: i32, radius: i32, color: [u8; 3]) {
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put_pixel(frame, cx + dx, cy + dy, color);
            }
        }
    }
}

/// Bresenham line, thickened by stamping a small disc at every step.
fn draw_line(frame: &mut Frame, x1: i32, y1: i32, x2: i32, y2: i32, thickness: i32, color: [u8; 3]) {
    let stamp = (thickness / 2).max(0);
    let (dx, dy) = ((x2 - x1).abs(), -(y2 - y1).abs());
    let (sx, sy) = (if x1 < x2 { 1 } else { -1 }, if y1 < y2 { 1 } else { -1 });
    let (mut x, mut y) = (x1, y1);
    let mut err = dx + dy;
    loop {
        fill_disc(frame, x, y, stamp, color);
        if x == x2 && y == y2 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn draw_rect(frame: &mut Frame, x1: i32, y1: i32, x2: i32, y2: i32, thickness: i32, color: [u8; 3]) {
    let (left, right) = (x1.min(x2), x1.max(x2));
    let (top, bottom) = (y1.min(y2), y1.max(y2));
    for t in 0..thickness.max(1) {
        for x in left..=right {
            put_pixel(frame, x, top + t, color);
            put_pixel(frame, x, bottom - t, color);
        }
        for y in top..=bottom {
            put_pixel(frame, left + t, y, color);
            put_pixel(frame, right - t, y, color);
        }
    }
}
