//! Control protocol.
//!
//! Clients send JSON text frames with a `command` field; the server answers
//! each with exactly one JSON text frame. Stream frames travel as binary
//! messages on the same socket without any envelope, so a client tells them
//! apart only by message type.
//!
//! Commands are accepted under their kebab-case names and under the names
//! older clients use:
//!
//! | canonical | alias |
//! |---|---|
//! | `select-family` | `set_camera` |
//! | `discover` | `get_devices` |
//! | `connect` | |
//! | `disconnect` | |
//! | `start-stream` | `start_stream` |
//! | `stop-stream` | `stop_stream` |
//! | `get-min` | `getMin` |
//! | `get-max` | `getMax` |
//! | `get-current` | `getCurrent` |
//! | `set-value` | `setValue` |
//! | `save-settings` | `saveSettings` |
//! | `set-processing` | `setProcessing` |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::camera::{CameraFamily, DeviceDescriptor, ParameterValue};
use crate::pipeline::ProcessingOptions;

/// Parameter used by get-min / get-max when the request names none.
pub const DEFAULT_RANGE_PARAMETER: &str = "ExposureTime";

/// Hint attached to failures that usually mean a missing vendor install.
pub const SDK_SUGGESTION: &str = "Check if camera SDK is installed and DLL paths are correct";

/// Wire-level rejections. All are recoverable; the connection stays open.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Text is not valid JSON.
    #[error("Invalid JSON")]
    InvalidJson,

    /// JSON that does not have the request shape.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// No `command` field.
    #[error("Missing 'command' field")]
    MissingCommand,

    /// `command` is not recognised.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A field the command needs is absent.
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// A field has an unusable value.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// `camera_type` names no known family.
    #[error("Unknown camera type: {0}")]
    UnknownFamily(String),

    /// A device command arrived before `select-family`.
    #[error("Camera type not set. Please set camera type first.")]
    FamilyNotSelected,

    /// No session for this index on this connection.
    #[error("Camera {0} not connected")]
    NotConnected(u32),

    /// This connection already holds a session for the index.
    #[error("Camera {0} is already connected")]
    AlreadyConnected(u32),

    /// Another connection holds the device.
    #[error("Camera {0} is in use by another client")]
    DeviceBusy(u32),

    /// The command needs a running stream.
    #[error("Camera {0} is not streaming")]
    NotStreaming(u32),
}

/// Raw inbound message. Every field is optional at this stage; [`Command`]
/// conversion enforces what each command needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Request {
    /// Command name.
    pub command: Option<String>,
    /// Device index.
    pub index: Option<u32>,
    /// Family for select-family.
    pub camera_type: Option<String>,
    /// Requested stream width.
    pub width: Option<u32>,
    /// Requested stream height.
    pub height: Option<u32>,
    /// Parameter name.
    pub parameter: Option<String>,
    /// Parameter value for set-value.
    pub value: Option<serde_json::Value>,
    /// Transform options for start-stream / set-processing.
    pub processing: Option<ProcessingOptions>,
}

impl Request {
    /// Parses one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| match e.classify() {
            serde_json::error::Category::Data => ProtocolError::Malformed(e.to_string()),
            _ => ProtocolError::InvalidJson,
        })
    }

    fn require_index(&self) -> Result<u32, ProtocolError> {
        self.index.ok_or(ProtocolError::MissingField("index"))
    }
}

/// A validated command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Tear down all sessions and switch vendor family.
    SelectFamily {
        /// New family.
        family: CameraFamily,
    },
    /// List devices of the active family.
    Discover,
    /// Open a device.
    Connect {
        /// Device index.
        index: u32,
    },
    /// Close a device. Unknown index is a no-op.
    Disconnect {
        /// Device index.
        index: u32,
    },
    /// Start (or restart) streaming.
    StartStream {
        /// Device index.
        index: u32,
        /// Requested width; only applied together with `height`.
        width: Option<u32>,
        /// Requested height; only applied together with `width`.
        height: Option<u32>,
        /// Transform for this stream.
        processing: ProcessingOptions,
    },
    /// Stop streaming. Unknown index is a no-op.
    StopStream {
        /// Device index.
        index: u32,
    },
    /// Lower bound of a parameter.
    GetMin {
        /// Device index.
        index: u32,
        /// Parameter name.
        parameter: String,
    },
    /// Upper bound of a parameter.
    GetMax {
        /// Device index.
        index: u32,
        /// Parameter name.
        parameter: String,
    },
    /// All known parameters.
    GetCurrent {
        /// Device index.
        index: u32,
    },
    /// Write a parameter.
    SetValue {
        /// Device index.
        index: u32,
        /// Parameter name.
        parameter: String,
        /// Converted value.
        value: ParameterValue,
        /// Value as sent, echoed in the reply.
        raw: serde_json::Value,
    },
    /// Persist device settings.
    SaveSettings {
        /// Device index.
        index: u32,
    },
    /// Replace the transform of a running stream.
    SetProcessing {
        /// Device index.
        index: u32,
        /// New transform.
        processing: ProcessingOptions,
    },
}

impl Command {
    /// Canonical command name.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SelectFamily { .. } => "select-family",
            Command::Discover => "discover",
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::StartStream { .. } => "start-stream",
            Command::StopStream { .. } => "stop-stream",
            Command::GetMin { .. } => "get-min",
            Command::GetMax { .. } => "get-max",
            Command::GetCurrent { .. } => "get-current",
            Command::SetValue { .. } => "set-value",
            Command::SaveSettings { .. } => "save-settings",
            Command::SetProcessing { .. } => "set-processing",
        }
    }

    /// Device index the command targets, if any.
    pub fn index(&self) -> Option<u32> {
        match self {
            Command::SelectFamily { .. } | Command::Discover => None,
            Command::Connect { index }
            | Command::Disconnect { index }
            | Command::StartStream { index, .. }
            | Command::StopStream { index }
            | Command::GetMin { index, .. }
            | Command::GetMax { index, .. }
            | Command::GetCurrent { index }
            | Command::SetValue { index, .. }
            | Command::SaveSettings { index }
            | Command::SetProcessing { index, .. } => Some(*index),
        }
    }
}

impl TryFrom<Request> for Command {
    type Error = ProtocolError;

    fn try_from(req: Request) -> Result<Self, Self::Error> {
        let name = req.command.as_deref().ok_or(ProtocolError::MissingCommand)?;

        let command = match name {
            "select-family" | "set_camera" => {
                let raw = req
                    .camera_type
                    .as_deref()
                    .ok_or(ProtocolError::MissingField("camera_type"))?;
                let family = raw
                    .parse::<CameraFamily>()
                    .map_err(|_| ProtocolError::UnknownFamily(raw.to_string()))?;
                Command::SelectFamily { family }
            }
            "discover" | "get_devices" => Command::Discover,
            "connect" => Command::Connect {
                index: req.require_index()?,
            },
            "disconnect" => Command::Disconnect {
                index: req.require_index()?,
            },
            "start-stream" | "start_stream" => Command::StartStream {
                index: req.require_index()?,
                width: req.width,
                height: req.height,
                processing: req.processing.clone().unwrap_or_default(),
            },
            "stop-stream" | "stop_stream" => Command::StopStream {
                index: req.require_index()?,
            },
            "get-min" | "getMin" => Command::GetMin {
                index: req.require_index()?,
                parameter: req
                    .parameter
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RANGE_PARAMETER.to_string()),
            },
            "get-max" | "getMax" => Command::GetMax {
                index: req.require_index()?,
                parameter: req
                    .parameter
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RANGE_PARAMETER.to_string()),
            },
            "get-current" | "getCurrent" => Command::GetCurrent {
                index: req.require_index()?,
            },
            "set-value" | "setValue" => {
                let index = req.require_index()?;
                let parameter = req
                    .parameter
                    .clone()
                    .ok_or(ProtocolError::MissingField("parameter"))?;
                let raw = req.value.clone().ok_or(ProtocolError::MissingField("value"))?;
                let value =
                    ParameterValue::from_json(&raw).ok_or_else(|| ProtocolError::InvalidField {
                        field: "value",
                        reason: "expected a number, string or boolean".to_string(),
                    })?;
                Command::SetValue {
                    index,
                    parameter,
                    value,
                    raw,
                }
            }
            "save-settings" | "saveSettings" => Command::SaveSettings {
                index: req.require_index()?,
            },
            "set-processing" | "setProcessing" => Command::SetProcessing {
                index: req.require_index()?,
                processing: req
                    .processing
                    .clone()
                    .ok_or(ProtocolError::MissingField("processing"))?,
            },
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

/// Outcome marker used in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Operation succeeded.
    Success,
    /// Operation succeeded with caveats.
    Warning,
    /// Operation failed.
    Error,
}

/// One outbound control reply.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    /// Command name as the client sent it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Device index the reply concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Command-specific fields.
    #[serde(flatten)]
    pub body: ReplyBody,
}

/// Command-specific reply fields.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
    /// select-family.
    FamilySelected {
        /// Human-readable outcome.
        message: String,
        /// `success`, or `warning` when the SDK is missing.
        status: Status,
        /// Whether the family's SDK was found.
        sdk_available: bool,
    },
    /// discover.
    Devices {
        /// Attached devices.
        devices: Vec<DeviceDescriptor>,
    },
    /// connect.
    Connected {
        /// Human-readable outcome.
        message: String,
        /// Always `success`.
        status: Status,
        /// Native width.
        width: u32,
        /// Native height.
        height: u32,
    },
    /// start-stream.
    StreamStarted {
        /// Human-readable outcome.
        message: String,
        /// Always `success`.
        status: Status,
        /// Width frames are produced at.
        frame_width: u32,
        /// Height frames are produced at.
        frame_height: u32,
    },
    /// get-min. Empty when the device cannot report the bound.
    Min {
        /// `{parameter: value}`.
        min: BTreeMap<String, f64>,
    },
    /// get-max. Empty when the device cannot report the bound.
    Max {
        /// `{parameter: value}`.
        max: BTreeMap<String, f64>,
    },
    /// get-current. Unreadable parameters are `null`.
    Current {
        /// Every known parameter.
        current: BTreeMap<String, Option<ParameterValue>>,
    },
    /// set-value, success or failure.
    ValueSet {
        /// Parameter name.
        parameter: String,
        /// Value as sent.
        value: serde_json::Value,
        /// Outcome.
        status: Status,
        /// Failure description.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// disconnect, stop-stream, save-settings, set-processing.
    Ack {
        /// Human-readable outcome.
        message: String,
        /// Always `success`.
        status: Status,
    },
    /// Any failure.
    Error {
        /// Always `error`.
        status: Status,
        /// Description.
        error: String,
        /// Actionable hint.
        #[serde(skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
    },
}

impl Reply {
    /// Reply for `command` about device `index`.
    pub fn new(command: Option<&str>, index: Option<u32>, body: ReplyBody) -> Self {
        Self {
            command: command.map(str::to_string),
            index,
            body,
        }
    }

    /// Error reply.
    pub fn error(
        command: Option<&str>,
        index: Option<u32>,
        error: impl ToString,
        suggestion: Option<&str>,
    ) -> Self {
        Self::new(
            command,
            index,
            ReplyBody::Error {
                status: Status::Error,
                error: error.to_string(),
                suggestion: suggestion.map(str::to_string),
            },
        )
    }

    /// Whether this reply reports a failure.
    pub fn is_error(&self) -> bool {
        matches!(
            self.body,
            ReplyBody::Error { .. }
                | ReplyBody::ValueSet {
                    status: Status::Error,
                    ..
                }
        )
    }

    /// Serialized text frame.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","error":"Failed to serialize reply: {e}"}}"#)
        })
    }
}
