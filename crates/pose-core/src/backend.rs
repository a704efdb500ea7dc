//! Pluggable pose backend: either a higher-level pose library that already
//! emits canonical people, or a generic keypoint detector whose raw output
//! the estimator has to normalize.

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use tch::{CModule, Device, IValue, Kind, Tensor};
use tracing::debug;

use crate::types::PersonPose;

/// Backend-native detector output for one image: per-detection boxes and
/// scores plus per-keypoint `(x, y, v)` triples, optionally accompanied by a
/// dedicated keypoint-score tensor.
#[derive(Debug, Clone, Default)]
pub struct RawDetections {
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub keypoints: Vec<Vec<[f32; 3]>>,
    pub keypoint_scores: Option<Vec<Vec<f32>>>,
}

impl RawDetections {
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty() || self.scores.is_empty() || self.keypoints.is_empty()
    }
}

/// Generic keypoint detector capability. The estimator owns resizing, score
/// filtering, and coordinate rescaling around this call.
pub trait DetectorModel: Send {
    fn infer(&self, image: &RgbImage) -> Result<RawDetections>;
}

/// Higher-level pose library capability that already produces per-person
/// keypoints, score, and bbox in source coordinates.
pub trait LibraryModel: Send {
    fn predict(&self, image: &RgbImage) -> Result<Vec<PersonPose>>;
}

/// The configured backend, chosen once at estimator construction.
pub enum PoseBackend {
    Library(Box<dyn LibraryModel>),
    Detector(Box<dyn DetectorModel>),
}

/// TorchScript Keypoint R-CNN wrapper.
///
/// The module follows the torchvision detection convention: input is a list
/// of `[3, H, W]` float tensors scaled to `[0, 1]`, output carries `boxes`,
/// `scores`, `keypoints`, and (optionally) `keypoints_scores` tensors per
/// image.
pub struct KeypointRcnn {
    module: CModule,
    device: Device,
}

impl KeypointRcnn {
    /// Load a TorchScript module onto the given device.
    pub fn load<P: AsRef<std::path::Path>>(model_path: P, device: Device) -> Result<Self> {
        let module = CModule::load_on_device(model_path.as_ref(), device)
            .with_context(|| format!("failed to load pose model {:?}", model_path.as_ref()))?;
        Ok(Self { module, device })
    }

    /// Convert an RGB image into a normalized `[3, H, W]` tensor on the
    /// inference device.
    fn rgb_to_tensor(&self, image: &RgbImage) -> Result<Tensor> {
        let (width, height) = image.dimensions();
        let expected = (width as usize) * (height as usize) * 3;
        let raw = image.as_raw();
        if raw.len() != expected {
            bail!(
                "unexpected image buffer size: got {} bytes, expected {expected}",
                raw.len()
            );
        }
        let tensor = Tensor::from_slice(raw)
            .view([height as i64, width as i64, 3])
            .permute([2, 0, 1])
            .to_device(self.device)
            .to_kind(Kind::Float)
            / 255.0;
        Ok(tensor)
    }
}

impl DetectorModel for KeypointRcnn {
    fn infer(&self, image: &RgbImage) -> Result<RawDetections> {
        let tensor = self.rgb_to_tensor(image)?;
        let output = tch::no_grad(|| {
            self.module
                .forward_is(&[IValue::TensorList(vec![tensor])])
        })
        .context("pose inference failed")?;

        let detections = first_detection_dict(output)?;
        let Some(dict) = detections else {
            debug!("detector returned no detection dict");
            return Ok(RawDetections::default());
        };

        let boxes = match dict_tensor(&dict, "boxes") {
            Some(tensor) => tensor_to_boxes(tensor)?,
            None => return Ok(RawDetections::default()),
        };
        let scores = match dict_tensor(&dict, "scores") {
            Some(tensor) => tensor_to_vec(tensor)?,
            None => return Ok(RawDetections::default()),
        };
        let keypoints = match dict_tensor(&dict, "keypoints") {
            Some(tensor) => tensor_to_keypoints(tensor)?,
            None => return Ok(RawDetections::default()),
        };
        let keypoint_scores = dict_tensor(&dict, "keypoints_scores")
            .or_else(|| dict_tensor(&dict, "keypoints_score"))
            .map(tensor_to_rows)
            .transpose()?;

        Ok(RawDetections {
            boxes,
            scores,
            keypoints,
            keypoint_scores,
        })
    }
}

/// TorchScript wrapper for a higher-level pose library whose output is
/// already per-person keypoints, score, and bbox in source coordinates.
pub struct ScriptedPoseLibrary {
    module: CModule,
    device: Device,
}

impl ScriptedPoseLibrary {
    pub fn load<P: AsRef<std::path::Path>>(model_path: P, device: Device) -> Result<Self> {
        let module = CModule::load_on_device(model_path.as_ref(), device)
            .with_context(|| format!("failed to load pose library {:?}", model_path.as_ref()))?;
        Ok(Self { module, device })
    }
}

impl LibraryModel for ScriptedPoseLibrary {
    fn predict(&self, image: &RgbImage) -> Result<Vec<PersonPose>> {
        let (width, height) = image.dimensions();
        let tensor = Tensor::from_slice(image.as_raw())
            .view([height as i64, width as i64, 3])
            .permute([2, 0, 1])
            .to_device(self.device)
            .to_kind(Kind::Float)
            / 255.0;
        let output = tch::no_grad(|| self.module.forward_is(&[IValue::Tensor(tensor)]))
            .context("pose library inference failed")?;

        let entries = match output {
            IValue::GenericList(items) => items,
            other => bail!("unexpected pose library output: {other:?}"),
        };

        let mut people = Vec::with_capacity(entries.len());
        for entry in entries {
            let IValue::GenericDict(dict) = entry else {
                bail!("unexpected pose library entry");
            };
            let keypoints = match dict_tensor(&dict, "keypoints") {
                Some(tensor) => tensor_to_keypoints_flat(tensor)?,
                None => continue,
            };
            let score = dict_tensor(&dict, "score")
                .map(tensor_to_vec)
                .transpose()?
                .and_then(|v| v.first().copied())
                .unwrap_or(1.0);
            let bbox = dict_tensor(&dict, "bbox")
                .map(tensor_to_vec)
                .transpose()?
                .filter(|v| v.len() == 4)
                .map(|v| [v[0], v[1], v[2], v[3]]);
            people.push(PersonPose {
                keypoints: keypoints
                    .into_iter()
                    .enumerate()
                    .map(|(j, [x, y, s])| {
                        crate::types::Keypoint::new(x, y, s, crate::types::KeypointName::from_index(j))
                    })
                    .collect(),
                score,
                bbox,
            });
        }
        debug!(people = people.len(), "pose library detections");
        Ok(people)
    }
}

/// Unwrap the torchvision scripted-module output down to the first image's
/// detection dict. Scripted detection models return
/// `(losses, List[Dict[str, Tensor]])`; an eager export may yield the list
/// directly.
fn first_detection_dict(output: IValue) -> Result<Option<Vec<(IValue, IValue)>>> {
    let list = match output {
        IValue::Tuple(items) => items
            .into_iter()
            .find(|item| matches!(item, IValue::GenericList(_)))
            .ok_or_else(|| anyhow!("detector output tuple carries no detection list"))?,
        other => other,
    };
    match list {
        IValue::GenericList(mut items) => {
            if items.is_empty() {
                return Ok(None);
            }
            match items.remove(0) {
                IValue::GenericDict(dict) => Ok(Some(dict)),
                other => bail!("unexpected detection entry: {other:?}"),
            }
        }
        IValue::GenericDict(dict) => Ok(Some(dict)),
        other => bail!("unexpected detector output: {other:?}"),
    }
}

fn dict_tensor<'a>(dict: &'a [(IValue, IValue)], key: &str) -> Option<&'a Tensor> {
    dict.iter().find_map(|(k, v)| match (k, v) {
        (IValue::String(name), IValue::Tensor(tensor)) if name == key => Some(tensor),
        _ => None,
    })
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor.to_device(Device::Cpu).to_kind(Kind::Float);
    Vec::<f32>::try_from(&flat.flatten(0, -1)).context("failed to extract tensor")
}

fn tensor_to_boxes(tensor: &Tensor) -> Result<Vec<[f32; 4]>> {
    let size = tensor.size();
    if size.len() != 2 || size[1] != 4 {
        bail!("unexpected boxes shape: {size:?}");
    }
    let flat = tensor_to_vec(tensor)?;
    Ok(flat
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect())
}

fn tensor_to_rows(tensor: &Tensor) -> Result<Vec<Vec<f32>>> {
    let size = tensor.size();
    if size.len() != 2 {
        bail!("unexpected keypoint-score shape: {size:?}");
    }
    let cols = size[1] as usize;
    let flat = tensor_to_vec(tensor)?;
    Ok(flat.chunks(cols.max(1)).map(|row| row.to_vec()).collect())
}

/// `[K, 3]` keypoints for one person.
fn tensor_to_keypoints_flat(tensor: &Tensor) -> Result<Vec<[f32; 3]>> {
    let size = tensor.size();
    if size.len() != 2 || size[1] != 3 {
        bail!("unexpected keypoints shape: {size:?}");
    }
    let flat = tensor_to_vec(tensor)?;
    Ok(flat
        .chunks_exact(3)
        .map(|kp| [kp[0], kp[1], kp[2]])
        .collect())
}

fn tensor_to_keypoints(tensor: &Tensor) -> Result<Vec<Vec<[f32; 3]>>> {
    let size = tensor.size();
    if size.len() != 3 || size[2] != 3 {
        bail!("unexpected keypoints shape: {size:?}");
    }
    let per_person = size[1] as usize;
    let flat = tensor_to_vec(tensor)?;
    Ok(flat
        .chunks_exact(per_person.max(1) * 3)
        .map(|person| {
            person
                .chunks_exact(3)
                .map(|kp| [kp[0], kp[1], kp[2]])
                .collect()
        })
        .collect())
}
