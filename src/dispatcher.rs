//! Per-connection protocol state machine.
//!
//! A [`Dispatcher`] owns one connection's active family and session registry.
//! It handles one inbound text frame at a time and queues exactly one reply
//! for it before the next frame is read, which keeps replies in request order.
//! Streaming tasks share the same outbound queue and interleave freely with
//! replies.
//!
//! ```text
//!   Idle --select-family--> FamilySelected --(any device command)--> FamilySelected
//!     ^                         |
//!     +----- connection close: stop all streams, disconnect all devices
//! ```

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::camera::{CameraFamily, DriverCatalog, ParameterValue};
use crate::config::{ServiceConfig, StreamingConfig};
use crate::error::{AppResult, ServiceError};
use crate::pipeline::ProcessingOptions;
use crate::protocol::{Command, ProtocolError, Reply, ReplyBody, Request, Status, SDK_SUGGESTION};
use crate::registry::{DeviceClaims, DeviceSession, SessionRegistry};
use crate::sdk::{LibraryProbe, SdkAvailability, StaticAvailability};
use crate::streaming::{Outbound, StreamHandle, StreamSettings};

/// Process-wide collaborators shared by every connection.
pub struct ServiceContext {
    /// Device construction per family.
    pub catalog: DriverCatalog,
    /// SDK availability answers for select-family.
    pub availability: Arc<dyn SdkAvailability>,
    /// Hardware exclusivity across connections.
    pub claims: DeviceClaims,
    /// Streaming settings.
    pub streaming: StreamingConfig,
}

impl ServiceContext {
    /// Context from explicit parts.
    pub fn new(
        catalog: DriverCatalog,
        availability: Arc<dyn SdkAvailability>,
        streaming: StreamingConfig,
    ) -> Self {
        Self {
            catalog: catalog.with_capture_timeout(streaming.capture_timeout()),
            availability,
            claims: DeviceClaims::new(),
            streaming,
        }
    }

    /// Context for a loaded configuration: simulated devices when the
    /// simulator is enabled, library probing otherwise.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let streaming = config.streaming.clone();
        if config.simulator.enabled {
            let sim = &config.simulator;
            info!(
                devices_per_family = sim.devices_per_family,
                width = sim.width,
                height = sim.height,
                "Using simulated cameras"
            );
            Self::new(
                DriverCatalog::simulated(sim.devices_per_family, sim.width, sim.height),
                Arc::new(StaticAvailability::all()),
                streaming,
            )
        } else {
            Self::new(
                DriverCatalog::default(),
                Arc::new(LibraryProbe::new(config.sdk.clone())),
                streaming,
            )
        }
    }

    fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            frame_interval: self.streaming.frame_interval(),
            jpeg_quality: self.streaming.jpeg_quality,
        }
    }

    fn stop_grace(&self) -> Duration {
        self.streaming.stop_grace()
    }
}

/// Protocol state for one connection.
pub struct Dispatcher {
    ctx: Arc<ServiceContext>,
    family: Option<CameraFamily>,
    registry: SessionRegistry,
    outbound: mpsc::Sender<Outbound>,
    streams: CancellationToken,
}

impl Dispatcher {
    /// Dispatcher writing replies and frames to `outbound`.
    pub fn new(ctx: Arc<ServiceContext>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            ctx,
            family: None,
            registry: SessionRegistry::new(),
            outbound,
            streams: CancellationToken::new(),
        }
    }

    /// Active family, if one was selected.
    pub fn family(&self) -> Option<CameraFamily> {
        self.family
    }

    /// This connection's sessions.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Handles one inbound text frame and queues its reply.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::ConnectionClosed` when the outbound queue is gone.
    pub async fn handle_text(&mut self, text: &str) -> AppResult<()> {
        let reply = self.process(text).await;
        self.outbound
            .send(Outbound::Text(reply.to_text()))
            .await
            .map_err(|_| ServiceError::ConnectionClosed)
    }

    /// Handles one inbound text frame and returns its reply.
    pub async fn process(&mut self, text: &str) -> Reply {
        let request = match Request::parse(text) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected message: {e}");
                return Reply::error(None, None, e, None);
            }
        };

        let sent_name = request.command.clone();
        let sent_index = request.index;
        let command = match Command::try_from(request) {
            Ok(command) => command,
            Err(e) => {
                warn!(command = ?sent_name, "Rejected command: {e}");
                return Reply::error(sent_name.as_deref(), sent_index, e, None);
            }
        };

        let name = sent_name.unwrap_or_else(|| command.name().to_string());
        let kind = command.name();
        let index = command.index();
        info!(command = kind, ?index, "Received command");

        match self.execute(command).await {
            Ok(body) => Reply::new(Some(&name), index, body),
            Err(err) => {
                let detail = match &err {
                    ServiceError::Camera(e) => e.to_string(),
                    ServiceError::Protocol(e) => e.to_string(),
                    other => other.to_string(),
                };
                let camera_failure = matches!(err, ServiceError::Camera(_));
                let (text, suggestion) = match (kind, index) {
                    ("connect", Some(i)) if camera_failure => (
                        format!("Failed to connect to camera {i}: {detail}"),
                        Some(SDK_SUGGESTION),
                    ),
                    ("start-stream", _) if camera_failure => {
                        (format!("Failed to start stream: {detail}"), None)
                    }
                    _ => (detail, None),
                };
                warn!(command = kind, ?index, "{text}");
                Reply::error(Some(&name), index, text, suggestion)
            }
        }
    }

    async fn execute(&mut self, command: Command) -> AppResult<ReplyBody> {
        match command {
            Command::SelectFamily { family } => Ok(self.select_family(family).await),
            Command::Discover => self.discover().await,
            Command::Connect { index } => self.connect(index).await,
            Command::Disconnect { index } => self.disconnect(index).await,
            Command::StartStream {
                index,
                width,
                height,
                processing,
            } => self.start_stream(index, width, height, processing).await,
            Command::StopStream { index } => self.stop_stream(index).await,
            Command::GetMin { index, parameter } => {
                let camera = Arc::clone(self.session(index)?.camera());
                let min = camera.parameter_min(&parameter).await;
                Ok(ReplyBody::Min {
                    min: min.map(|v| (parameter, v)).into_iter().collect(),
                })
            }
            Command::GetMax { index, parameter } => {
                let camera = Arc::clone(self.session(index)?.camera());
                let max = camera.parameter_max(&parameter).await;
                Ok(ReplyBody::Max {
                    max: max.map(|v| (parameter, v)).into_iter().collect(),
                })
            }
            Command::GetCurrent { index } => self.get_current(index).await,
            Command::SetValue {
                index,
                parameter,
                value,
                raw,
            } => self.set_value(index, parameter, value, raw).await,
            Command::SaveSettings { index } => {
                let camera = Arc::clone(self.session(index)?.camera());
                camera.save_settings().await?;
                Ok(ack("Camera settings saved successfully"))
            }
            Command::SetProcessing { index, processing } => {
                let session = self.session(index)?;
                let stream = session.stream().ok_or(ProtocolError::NotStreaming(index))?;
                stream.set_processing(processing);
                Ok(ack("Processing updated"))
            }
        }
    }

    fn session(&self, index: u32) -> Result<&DeviceSession, ProtocolError> {
        self.registry.get(index).ok_or(ProtocolError::NotConnected(index))
    }

    fn active_family(&self) -> Result<CameraFamily, ProtocolError> {
        self.family.ok_or(ProtocolError::FamilyNotSelected)
    }

    async fn select_family(&mut self, family: CameraFamily) -> ReplyBody {
        self.teardown_sessions().await;
        self.family = Some(family);

        let availability = Arc::clone(&self.ctx.availability);
        let sdk_available = tokio::task::spawn_blocking(move || availability.initialize(family))
            .await
            .unwrap_or(false);

        if sdk_available {
            ReplyBody::FamilySelected {
                message: format!("Camera type set to {family}"),
                status: Status::Success,
                sdk_available,
            }
        } else {
            ReplyBody::FamilySelected {
                message: format!("Camera type set to {family}, but SDK may not be available"),
                status: Status::Warning,
                sdk_available,
            }
        }
    }

    async fn discover(&self) -> AppResult<ReplyBody> {
        let family = self.active_family()?;
        let devices = self.ctx.catalog.create(family, 0).discover().await;
        debug!(%family, count = devices.len(), "Discovery finished");
        Ok(ReplyBody::Devices { devices })
    }

    async fn connect(&mut self, index: u32) -> AppResult<ReplyBody> {
        let family = self.active_family()?;
        if self.registry.contains(index) {
            return Err(ProtocolError::AlreadyConnected(index).into());
        }
        let claim = self
            .ctx
            .claims
            .try_claim(family, index)
            .ok_or(ProtocolError::DeviceBusy(index))?;

        let camera = self.ctx.catalog.create(family, index);
        camera.connect().await?;

        let (width, height) = (camera.width(), camera.height());
        if self
            .registry
            .insert(DeviceSession::new(index, camera, claim))
            .is_err()
        {
            return Err(ProtocolError::AlreadyConnected(index).into());
        }
        info!(%family, index, width, height, "Camera connected");

        Ok(ReplyBody::Connected {
            message: format!("Connected to camera {index}"),
            status: Status::Success,
            width,
            height,
        })
    }

    async fn disconnect(&mut self, index: u32) -> AppResult<ReplyBody> {
        if let Some(session) = self.registry.remove(index) {
            session.teardown(self.ctx.stop_grace()).await?;
            info!(index, "Camera disconnected");
        } else {
            debug!(index, "Disconnect for unknown index ignored");
        }
        Ok(ack(format!("Disconnected from camera {index}")))
    }

    async fn start_stream(
        &mut self,
        index: u32,
        width: Option<u32>,
        height: Option<u32>,
        processing: ProcessingOptions,
    ) -> AppResult<ReplyBody> {
        let grace = self.ctx.stop_grace();
        let settings = self.ctx.stream_settings();
        let outbound = self.outbound.clone();
        let session = self
            .registry
            .get_mut(index)
            .ok_or(ProtocolError::NotConnected(index))?;

        let previous = session
            .stream()
            .map(|stream| (session.last_stream_resolution(), stream.processing()));
        if previous.is_some() {
            debug!(index, "Restarting stream");
            session.stop_streaming(grace).await?;
        }

        let camera = Arc::clone(session.camera());
        if let Err(e) = camera.start_stream(width, height).await {
            // A refused restart leaves the previous stream running.
            if let Some((resolution, options)) = previous {
                let (w, h) = resolution.unzip();
                match camera.start_stream(w, h).await {
                    Ok(()) => {
                        session.attach_stream(StreamHandle::spawn(
                            index,
                            Arc::clone(&camera),
                            outbound,
                            settings,
                            options,
                            &self.streams,
                        ));
                        debug!(index, "Previous stream resumed");
                    }
                    Err(resume) => warn!(index, "Could not resume previous stream: {resume}"),
                }
            }
            return Err(e.into());
        }
        session.set_last_stream_resolution(width.zip(height));

        let handle = StreamHandle::spawn(
            index,
            Arc::clone(&camera),
            outbound,
            settings,
            processing,
            &self.streams,
        );
        session.attach_stream(handle);

        let (frame_width, frame_height) = (camera.width(), camera.height());
        info!(index, frame_width, frame_height, "Stream started");
        Ok(ReplyBody::StreamStarted {
            message: "Stream started".to_string(),
            status: Status::Success,
            frame_width,
            frame_height,
        })
    }

    async fn stop_stream(&mut self, index: u32) -> AppResult<ReplyBody> {
        let grace = self.ctx.stop_grace();
        match self.registry.get_mut(index) {
            Some(session) => {
                session.stop_streaming(grace).await?;
            }
            None => debug!(index, "Stop for unknown index ignored"),
        }
        Ok(ack("Stream stopped"))
    }

    async fn get_current(&self, index: u32) -> AppResult<ReplyBody> {
        let camera = Arc::clone(self.session(index)?.camera());
        let mut current = BTreeMap::new();
        for name in camera.parameter_names() {
            let value = camera.parameter_current(&name).await;
            current.insert(name, value);
        }
        Ok(ReplyBody::Current { current })
    }

    async fn set_value(
        &self,
        index: u32,
        parameter: String,
        value: ParameterValue,
        raw: serde_json::Value,
    ) -> AppResult<ReplyBody> {
        let camera = Arc::clone(self.session(index)?.camera());
        let body = match camera.set_parameter(&parameter, &value).await {
            Ok(()) => ReplyBody::ValueSet {
                parameter,
                value: raw,
                status: Status::Success,
                error: None,
            },
            Err(e) => {
                warn!(index, %parameter, "Set failed: {e}");
                ReplyBody::ValueSet {
                    error: Some(format!("Failed to set {parameter}: {e}")),
                    parameter,
                    value: raw,
                    status: Status::Error,
                }
            }
        };
        Ok(body)
    }

    async fn teardown_sessions(&mut self) {
        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return;
        }
        let grace = self.ctx.stop_grace();
        let count = sessions.len();
        let results = join_all(sessions.into_iter().map(|s| s.teardown(grace))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(count, failed, "Sessions torn down");
    }

    /// Stops every stream and disconnects every device of this connection.
    pub async fn shutdown(&mut self) {
        self.streams.cancel();
        self.teardown_sessions().await;
        self.family = None;
    }
}

fn ack(message: impl Into<String>) -> ReplyBody {
    ReplyBody::Ack {
        message: message.into(),
        status: Status::Success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn dispatcher() -> (Dispatcher, mpsc::Receiver<Outbound>) {
        let ctx = ServiceContext::new(
            DriverCatalog::simulated(2, 64, 48),
            Arc::new(StaticAvailability::all().with(CameraFamily::Mshot, false)),
            StreamingConfig::default(),
        );
        let (tx, rx) = mpsc::channel(32);
        (Dispatcher::new(Arc::new(ctx), tx), rx)
    }

    async fn call(d: &mut Dispatcher, msg: Value) -> Value {
        let reply = d.process(&msg.to_string()).await;
        serde_json::from_str(&reply.to_text()).unwrap()
    }

    #[tokio::test]
    async fn device_commands_need_family() {
        let (mut d, _rx) = dispatcher();
        let reply = call(&mut d, json!({"command": "discover"})).await;
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error"], "Camera type not set. Please set camera type first.");

        let reply = call(&mut d, json!({"command": "connect", "index": 0})).await;
        assert_eq!(reply["status"], "error");
    }

    #[tokio::test]
    async fn missing_sdk_is_a_warning() {
        let (mut d, _rx) = dispatcher();
        let reply = call(&mut d, json!({"command": "set_camera", "camera_type": "mshot"})).await;
        assert_eq!(reply["command"], "set_camera");
        assert_eq!(reply["status"], "warning");
        assert_eq!(reply["sdk_available"], false);
        assert_eq!(d.family(), Some(CameraFamily::Mshot));
    }

    #[tokio::test]
    async fn connect_failure_carries_suggestion() {
        let (mut d, _rx) = dispatcher();
        call(&mut d, json!({"command": "select-family", "camera_type": "ids"})).await;
        let reply = call(&mut d, json!({"command": "connect", "index": 7})).await;
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["index"], 7);
        assert!(reply["error"].as_str().unwrap().starts_with("Failed to connect to camera 7"));
        assert_eq!(reply["suggestion"], SDK_SUGGESTION);
        assert!(d.registry().is_empty());
        assert!(!d.ctx.claims.is_claimed(CameraFamily::Ids, 7));
    }

    #[tokio::test]
    async fn range_queries() {
        let (mut d, _rx) = dispatcher();
        call(&mut d, json!({"command": "select-family", "camera_type": "ids"})).await;
        call(&mut d, json!({"command": "connect", "index": 0})).await;

        let reply = call(&mut d, json!({"command": "getMin", "index": 0})).await;
        assert_eq!(reply["min"], json!({"ExposureTime": 10.0}));

        let msg = json!({"command": "get-max", "index": 0, "parameter": "Gain"});
        let reply = call(&mut d, msg).await;
        assert_eq!(reply["max"], json!({"Gain": 24.0}));

        let msg = json!({"command": "get-max", "index": 0, "parameter": "PixelFormat"});
        let reply = call(&mut d, msg).await;
        assert_eq!(reply["max"], json!({}));
    }

    #[tokio::test]
    async fn set_value_failure_echoes_request() {
        let (mut d, _rx) = dispatcher();
        call(&mut d, json!({"command": "select-family", "camera_type": "hikrobot"})).await;
        call(&mut d, json!({"command": "connect", "index": 0})).await;

        let reply = call(
            &mut d,
            json!({"command": "setValue", "index": 0, "parameter": "Gain", "value": 500}),
        )
        .await;
        assert_eq!(reply["command"], "setValue");
        assert_eq!(reply["parameter"], "Gain");
        assert_eq!(reply["value"], 500);
        assert_eq!(reply["status"], "error");
        assert!(reply["error"].as_str().unwrap().starts_with("Failed to set Gain"));
    }

    #[tokio::test]
    async fn save_settings_and_processing_need_session() {
        let (mut d, _rx) = dispatcher();
        call(&mut d, json!({"command": "select-family", "camera_type": "hikrobot"})).await;

        let reply = call(&mut d, json!({"command": "saveSettings", "index": 0})).await;
        assert_eq!(reply["error"], "Camera 0 not connected");

        call(&mut d, json!({"command": "connect", "index": 0})).await;
        let reply = call(&mut d, json!({"command": "saveSettings", "index": 0})).await;
        assert_eq!(reply["status"], "success");

        let reply = call(
            &mut d,
            json!({"command": "set-processing", "index": 0, "processing": {"grayscale": true}}),
        )
        .await;
        assert_eq!(reply["error"], "Camera 0 is not streaming");
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let (mut d, _rx) = dispatcher();
        call(&mut d, json!({"command": "select-family", "camera_type": "ids"})).await;
        call(&mut d, json!({"command": "connect", "index": 0})).await;
        call(&mut d, json!({"command": "connect", "index": 1})).await;
        call(&mut d, json!({"command": "start-stream", "index": 1})).await;
        assert_eq!(d.registry().len(), 2);
        assert_eq!(d.registry().streaming_count(), 1);

        d.shutdown().await;
        assert!(d.registry().is_empty());
        assert!(d.ctx.claims.is_empty());
        assert_eq!(d.family(), None);
    }
}
