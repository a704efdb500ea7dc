use serde::Serialize;
use tch::Device;
use tracing::debug;

/// Compute target kinds, in probe priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Mps,
    Cuda,
    Cpu,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Mps => "mps",
            DeviceKind::Cuda => "cuda",
            DeviceKind::Cpu => "cpu",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "mps" => Some(DeviceKind::Mps),
            "cuda" => Some(DeviceKind::Cuda),
            "cpu" => Some(DeviceKind::Cpu),
            _ => None,
        }
    }

    pub fn to_device(self) -> Device {
        match self {
            DeviceKind::Mps => Device::Mps,
            DeviceKind::Cuda => Device::Cuda(0),
            DeviceKind::Cpu => Device::Cpu,
        }
    }
}

/// Human-readable summary of a selected compute target.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

/// Pick a compute target.
///
/// An explicit `preferred` naming a recognized kind is honored verbatim with
/// no availability check; that is the caller's responsibility. Otherwise the
/// first available of MPS, CUDA, CPU wins.
pub fn select_device(preferred: Option<&str>) -> (Device, DeviceKind) {
    let normalized = preferred.map(|p| p.trim().to_ascii_lowercase());
    let kind = match normalized.as_deref().and_then(DeviceKind::from_str) {
        Some(kind) => {
            debug!(device = kind.as_str(), "preferred device requested");
            kind
        }
        None => {
            let kind = if tch::utils::has_mps() {
                DeviceKind::Mps
            } else if tch::Cuda::is_available() {
                DeviceKind::Cuda
            } else {
                DeviceKind::Cpu
            };
            debug!(device = kind.as_str(), "auto-selected device");
            kind
        }
    };
    (kind.to_device(), kind)
}

/// Summarize a device kind for user-facing responses.
///
/// CUDA metadata probes are best-effort: any failure degrades the name to
/// `"unknown"` and is never surfaced as an error.
pub fn describe(kind: DeviceKind) -> DeviceInfo {
    match kind {
        DeviceKind::Cuda => {
            let count = tch::Cuda::device_count();
            if count > 0 {
                DeviceInfo {
                    kind,
                    name: format!("CUDA device 0 of {count}"),
                    capability: Some(format!(
                        "cudnn={}",
                        tch::Cuda::cudnn_is_available()
                    )),
                }
            } else {
                debug!("CUDA device info unavailable");
                DeviceInfo {
                    kind,
                    name: "unknown".to_string(),
                    capability: None,
                }
            }
        }
        DeviceKind::Mps => DeviceInfo {
            kind,
            name: "Apple Metal (MPS)".to_string(),
            capability: None,
        },
        DeviceKind::Cpu => DeviceInfo {
            kind,
            name: "CPU".to_string(),
            capability: None,
        },
    }
}
