//! Device capability abstraction.
//!
//! Every vendor family is driven through the same [`CameraDevice`] contract so
//! the dispatcher never needs to know which SDK sits underneath. The family is
//! chosen once, by [`catalog::DriverCatalog::create`]; everything downstream
//! only sees `Arc<dyn CameraDevice>`.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher --> DriverCatalog --(family)--> IdsCamera | MshotCamera | HikrobotCamera
//!                                                 |
//!                                                 v
//!                                        VendorSdk / SdkCamera  (external SDK boundary)
//! ```
//!
//! # Thread Safety
//!
//! All device methods take `&self` and implementations keep their state behind
//! async-aware locks, so one instance can be shared between the dispatcher and
//! the streaming task of the same device.

pub mod backend;
pub mod catalog;
pub mod hikrobot;
pub mod ids;
pub mod mshot;
pub mod simulated;

mod decode;
mod handle;

use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use catalog::DriverCatalog;

/// Parameter names reported by `get-current`.
pub const KNOWN_PARAMETERS: [&str; 7] = [
    "Width",
    "Height",
    "ExposureTime",
    "Gain",
    "AcquisitionFrameRate",
    "PixelFormat",
    "BalanceWhiteAuto",
];

/// Result alias for the device contract.
pub type CameraResult<T> = std::result::Result<T, CameraError>;

/// Errors raised by device variants.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    /// The family's SDK is not installed or could not be loaded.
    #[error("{0} SDK is not available")]
    SdkUnavailable(CameraFamily),

    /// No device exists at the requested index.
    #[error("No camera found at index {0}")]
    DeviceNotFound(u32),

    /// Operation requires a connected device.
    #[error("Camera is not connected")]
    NotConnected,

    /// The variant does not know this parameter.
    #[error("Unsupported parameter '{0}'")]
    UnsupportedParameter(String),

    /// The value could not be converted for this parameter.
    #[error("Invalid value for '{parameter}': {reason}")]
    InvalidValue {
        /// Parameter name.
        parameter: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The vendor SDK reported a failure.
    #[error("SDK error: {0}")]
    Sdk(String),
}

impl CameraError {
    pub(crate) fn sdk(err: anyhow::Error) -> Self {
        CameraError::Sdk(format!("{err:#}"))
    }
}

/// Vendor camera product line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFamily {
    /// IDS uEye cameras.
    Ids,
    /// Mshot microscope cameras.
    Mshot,
    /// Hikrobot MVS (GenICam) cameras.
    Hikrobot,
}

impl CameraFamily {
    /// All supported families.
    pub const ALL: [CameraFamily; 3] = [
        CameraFamily::Ids,
        CameraFamily::Mshot,
        CameraFamily::Hikrobot,
    ];

    /// Wire name used by `camera_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraFamily::Ids => "ids",
            CameraFamily::Mshot => "mshot",
            CameraFamily::Hikrobot => "hikrobot",
        }
    }
}

impl fmt::Display for CameraFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ids" => Ok(CameraFamily::Ids),
            "mshot" => Ok(CameraFamily::Mshot),
            "hikrobot" => Ok(CameraFamily::Hikrobot),
            other => Err(format!("Unknown camera type: {other}")),
        }
    }
}

/// Physical link a device is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interface {
    /// USB2/USB3 Vision.
    #[serde(rename = "USB")]
    Usb,
    /// GigE Vision.
    #[serde(rename = "GigE")]
    GigE,
}

/// Discovery-time summary of one physical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Index to pass to `connect`.
    pub index: u32,
    /// Vendor family.
    #[serde(rename = "type")]
    pub family: CameraFamily,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Attachment interface.
    pub interface: Interface,
    /// Network address for GigE devices.
    #[serde(rename = "ip", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// A parameter value as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Numeric value (exposure, gain, sizes, enum ordinals).
    Number(f64),
    /// Symbolic value (e.g. white-balance mode).
    Text(String),
}

impl ParameterValue {
    /// Numeric view of the value; text is parsed when it holds a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Number(v) => Some(*v),
            ParameterValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Textual view of the value.
    pub fn as_text(&self) -> String {
        match self {
            ParameterValue::Number(v) => v.to_string(),
            ParameterValue::Text(s) => s.clone(),
        }
    }

    /// Converts a JSON value received from a client.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(ParameterValue::Number),
            serde_json::Value::String(s) => Some(ParameterValue::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(ParameterValue::Number(if *b { 1.0 } else { 0.0 })),
            _ => None,
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Number(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::Text(v.to_string())
    }
}

/// Uniform contract every vendor family implements.
///
/// Lifecycle:
/// `connect` → (`start_stream` → `capture_frame`* → `stop_stream`)* → `disconnect`.
///
/// - `disconnect` and `stop_stream` are idempotent and safe on a never-connected
///   instance.
/// - `capture_frame` never blocks longer than the variant's bounded wait and
///   reports timeouts and decode failures as `None`.
/// - Parameter getters return `None` for anything the variant cannot read.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Family this instance drives.
    fn family(&self) -> CameraFamily;

    /// Device index this instance was created for.
    fn index(&self) -> u32;

    /// Enumerates attached devices of this family. Empty if the SDK is unavailable.
    async fn discover(&self) -> Vec<DeviceDescriptor>;

    /// Opens the device; on success width/height hold the native resolution.
    async fn connect(&self) -> CameraResult<()>;

    /// Stops any stream and releases the hardware handle.
    async fn disconnect(&self) -> CameraResult<()>;

    /// Starts acquisition, reconfiguring the resolution first when both
    /// dimensions are given.
    async fn start_stream(&self, width: Option<u32>, height: Option<u32>) -> CameraResult<()>;

    /// Stops acquisition.
    async fn stop_stream(&self) -> CameraResult<()>;

    /// Grabs one decoded frame, or `None` on timeout / decode failure.
    async fn capture_frame(&self) -> Option<DynamicImage>;

    /// Lower bound of a numeric parameter.
    async fn parameter_min(&self, name: &str) -> Option<f64>;

    /// Upper bound of a numeric parameter.
    async fn parameter_max(&self, name: &str) -> Option<f64>;

    /// Current value of a parameter.
    async fn parameter_current(&self, name: &str) -> Option<ParameterValue>;

    /// Writes a parameter.
    async fn set_parameter(&self, name: &str, value: &ParameterValue) -> CameraResult<()>;

    /// Persists current settings on the device (vendor user set).
    async fn save_settings(&self) -> CameraResult<()> {
        Ok(())
    }

    /// Current frame width in pixels.
    fn width(&self) -> u32;

    /// Current frame height in pixels.
    fn height(&self) -> u32;

    /// Whether a hardware handle is held.
    fn is_connected(&self) -> bool;

    /// Whether acquisition is running.
    fn is_streaming(&self) -> bool;

    /// Names reported by `get-current`.
    fn parameter_names(&self) -> Vec<String> {
        KNOWN_PARAMETERS.iter().map(|s| s.to_string()).collect()
    }
}
