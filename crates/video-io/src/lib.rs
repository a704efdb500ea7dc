//! Video container decode/encode on top of OpenCV.
//!
//! Request bodies arrive as in-memory bytes; [`TempVideo`] parks them in a
//! temporary file so `VideoCapture` can open them. [`VideoReader`] yields
//! sequential BGR8 frames, [`VideoSink`] writes annotated frames back out
//! as an `mp4v` container.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use opencv::{
    core::{MatTraitConst, MatTraitConstManual, Size},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst, VideoWriterTrait},
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("failed to open video source {path:?}")]
    Open { path: PathBuf },
    #[error("failed to create video writer {path:?}")]
    Create { path: PathBuf },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Raw decoded frame. Data is tightly packed BGR8, row-major.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

/// Container metadata from a best-effort probe. `frame_count` is absent when
/// the container does not report one.
#[derive(Debug, Clone, Copy)]
pub struct VideoMeta {
    pub frame_count: Option<u64>,
    pub fps: f64,
    pub width: i32,
    pub height: i32,
}

/// In-memory video bytes staged into a temporary file so OpenCV can open
/// them. The file lives as long as this handle.
pub struct TempVideo {
    file: NamedTempFile,
}

impl TempVideo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VideoError> {
        let mut file = NamedTempFile::with_suffix(".mp4")
            .context("failed to create temporary video file")?;
        file.write_all(bytes)
            .context("failed to stage video bytes")?;
        file.flush().context("failed to flush video bytes")?;
        debug!(path = ?file.path(), size = bytes.len(), "staged video bytes");
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Sequential frame reader over one container.
#[derive(Debug)]
pub struct VideoReader {
    cap: VideoCapture,
}

impl VideoReader {
    pub fn open(path: &Path) -> Result<Self, VideoError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("non-UTF-8 video path"))?;
        let cap = VideoCapture::from_file(path_str, videoio::CAP_ANY)
            .map_err(|e| VideoError::Other(e.into()))?;
        if !cap.is_opened().map_err(|e| VideoError::Other(e.into()))? {
            return Err(VideoError::Open {
                path: path.to_path_buf(),
            });
        }
        Ok(Self { cap })
    }

    /// Probe container metadata. Frame counts below one are reported as
    /// unknown rather than trusted.
    pub fn meta(&self) -> Result<VideoMeta, VideoError> {
        let fps = self
            .cap
            .get(videoio::CAP_PROP_FPS)
            .map_err(|e| VideoError::Other(e.into()))?;
        let frame_count = self
            .cap
            .get(videoio::CAP_PROP_FRAME_COUNT)
            .map_err(|e| VideoError::Other(e.into()))?;
        let width = self
            .cap
            .get(videoio::CAP_PROP_FRAME_WIDTH)
            .map_err(|e| VideoError::Other(e.into()))?;
        let height = self
            .cap
            .get(videoio::CAP_PROP_FRAME_HEIGHT)
            .map_err(|e| VideoError::Other(e.into()))?;
        Ok(VideoMeta {
            frame_count: (frame_count >= 1.0).then_some(frame_count as u64),
            fps: if fps > 0.0 { fps } else { 25.0 },
            width: width as i32,
            height: height as i32,
        })
    }

    /// Read the next frame, or `None` at end of stream.
    pub fn read(&mut self) -> Result<Option<Frame>, VideoError> {
        let mut mat = Mat::default();
        let ok = self
            .cap
            .read(&mut mat)
            .map_err(|e| VideoError::Other(e.into()))?;
        if !ok {
            return Ok(None);
        }
        let size = mat.size().map_err(|e| VideoError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(None);
        }
        let data = mat
            .data_bytes()
            .map_err(|e| VideoError::Other(e.into()))?
            .to_vec();
        Ok(Some(Frame {
            data,
            width: size.width,
            height: size.height,
            format: FrameFormat::Bgr8,
        }))
    }
}

/// Frame writer producing an `mp4v` container at a fixed FPS/geometry.
pub struct VideoSink {
    writer: videoio::VideoWriter,
}

impl VideoSink {
    pub fn create(path: &Path, fps: f64, width: i32, height: i32) -> Result<Self, VideoError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("non-UTF-8 video path"))?;
        let fourcc = videoio::VideoWriter::fourcc('m', 'p', '4', 'v')
            .map_err(|e| VideoError::Other(e.into()))?;
        let writer = videoio::VideoWriter::new(
            path_str,
            fourcc,
            fps,
            Size { width, height },
            true,
        )
        .map_err(|e| VideoError::Other(e.into()))?;
        if !writer
            .is_opened()
            .map_err(|e| VideoError::Other(e.into()))?
        {
            return Err(VideoError::Create {
                path: path.to_path_buf(),
            });
        }
        Ok(Self { writer })
    }

    pub fn write(&mut self, frame: &Frame) -> Result<(), VideoError> {
        debug_assert_eq!(frame.format, FrameFormat::Bgr8);
        let mat = Mat::from_slice(&frame.data).map_err(|e| VideoError::Other(e.into()))?;
        let mat = mat
            .reshape(3, frame.height)
            .map_err(|e| VideoError::Other(e.into()))?;
        self.writer
            .write(&mat)
            .map_err(|e| VideoError::Other(e.into()))?;
        Ok(())
    }

    pub fn release(&mut self) -> Result<(), VideoError> {
        self.writer
            .release()
            .map_err(|e| VideoError::Other(e.into()))?;
        Ok(())
    }
}

/// Best-effort frame-count probe for job bookkeeping. Any failure is
/// reported as unknown, never as an error.
pub fn probe_total_frames(bytes: &[u8]) -> Option<u64> {
    let staged = TempVideo::from_bytes(bytes).ok()?;
    let reader = VideoReader::open(staged.path()).ok()?;
    let meta = reader.meta().ok()?;
    meta.frame_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_video_stages_bytes_on_disk() {
        let staged = TempVideo::from_bytes(b"not a real container").unwrap();
        let on_disk = std::fs::read(staged.path()).unwrap();
        assert_eq!(on_disk, b"not a real container");
    }

    #[test]
    fn temp_video_is_removed_with_handle() {
        let path = {
            let staged = TempVideo::from_bytes(b"payload").unwrap();
            staged.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn probe_of_malformed_bytes_is_unknown() {
        assert_eq!(probe_total_frames(b"garbage"), None);
    }

    #[test]
    fn opening_a_missing_file_is_an_open_error() {
        let err = VideoReader::open(Path::new("/nonexistent/clip.mp4")).unwrap_err();
        assert!(matches!(err, VideoError::Open { .. }));
    }
}
