//! Hikrobot MVS (GenICam) variant.
//!
//! Sizes, exposure, gain and frame rate are integer nodes. `PixelFormat` is an
//! enumeration reported by ordinal, `BalanceWhiteAuto` is an enumeration
//! exposed by name, and `DigitalZoom` cannot be read back from the SDK, so the
//! last value written is reported instead. When a stream is started with an
//! explicit resolution, captured frames are scaled to fit it.

use async_trait::async_trait;
use image::DynamicImage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::backend::{RawDeviceInfo, VendorSdk};
use super::handle::DeviceHandle;
use super::{
    CameraDevice, CameraError, CameraFamily, CameraResult, DeviceDescriptor, ParameterValue,
    KNOWN_PARAMETERS,
};

const INTEGER_NODES: [&str; 5] = [
    "Width",
    "Height",
    "ExposureTime",
    "Gain",
    "AcquisitionFrameRate",
];
const DIGITAL_ZOOM: &str = "DigitalZoom";
const WHITE_BALANCE_MODES: [&str; 3] = ["Off", "Once", "Continuous"];

fn any_device(_: &RawDeviceInfo) -> bool {
    true
}

fn integer_node(name: &str) -> Option<&'static str> {
    INTEGER_NODES.iter().copied().find(|n| *n == name)
}

/// Maps a white-balance mode to its ordinal. Unknown names select `Off`.
fn white_balance_ordinal(value: &ParameterValue) -> u32 {
    match value {
        ParameterValue::Number(v) if (0.0..3.0).contains(v) => *v as u32,
        ParameterValue::Number(_) => 0,
        ParameterValue::Text(text) => WHITE_BALANCE_MODES
            .iter()
            .position(|m| *m == text.as_str())
            .map_or(0, |i| i as u32),
    }
}

/// Hikrobot MVS camera.
pub struct HikrobotCamera {
    handle: DeviceHandle,
    display: Mutex<Option<(u32, u32)>>,
    zoom: Mutex<Option<f64>>,
}

impl HikrobotCamera {
    /// Creates an unconnected instance for device `index`.
    pub fn new(index: u32, sdk: Arc<dyn VendorSdk>, capture_timeout: Duration) -> Self {
        Self {
            handle: DeviceHandle::new(CameraFamily::Hikrobot, index, sdk, capture_timeout),
            display: Mutex::new(None),
            zoom: Mutex::new(None),
        }
    }

    async fn integer_range(&self, name: &str) -> Option<(f64, f64)> {
        if !self.handle.is_connected() {
            return None;
        }
        let name = name.to_string();
        let node = self.handle.with_camera(move |cam| cam.numeric(&name)).await.ok()?;
        Some((node.min.trunc(), node.max.trunc()))
    }
}

#[async_trait]
impl CameraDevice for HikrobotCamera {
    fn family(&self) -> CameraFamily {
        self.handle.family()
    }

    fn index(&self) -> u32 {
        self.handle.index()
    }

    async fn discover(&self) -> Vec<DeviceDescriptor> {
        self.handle.discover(any_device).await
    }

    async fn connect(&self) -> CameraResult<()> {
        self.handle.open(any_device).await
    }

    async fn disconnect(&self) -> CameraResult<()> {
        *self.display.lock() = None;
        *self.zoom.lock() = None;
        self.handle.close().await
    }

    async fn start_stream(&self, width: Option<u32>, height: Option<u32>) -> CameraResult<()> {
        if !self.handle.is_connected() {
            return Err(CameraError::NotConnected);
        }
        let requested = width.zip(height).filter(|(w, h)| *w > 0 && *h > 0);

        if let Some((w, h)) = requested {
            // Each dimension is applied independently; a refused one keeps the
            // sensor value and the frame is scaled on capture instead.
            let (applied_w, applied_h) = self
                .handle
                .with_camera(move |cam| {
                    let w_ok = cam.set_numeric("Width", f64::from(w)).is_ok();
                    let h_ok = cam.set_numeric("Height", f64::from(h)).is_ok();
                    Ok((w_ok, h_ok))
                })
                .await?;
            let current_w = if applied_w { w } else { self.handle.width() };
            let current_h = if applied_h { h } else { self.handle.height() };
            self.handle.set_size(current_w, current_h);
            debug!(index = self.handle.index(), w, h, applied_w, applied_h, "Stream resolution");
        }
        *self.display.lock() = requested;

        let (w, h) = (self.handle.width(), self.handle.height());
        self.handle.start(None).await?;
        // Keep the size negotiated above rather than the sensor's read-back.
        self.handle.set_size(w, h);
        Ok(())
    }

    async fn stop_stream(&self) -> CameraResult<()> {
        self.handle.stop().await
    }

    async fn capture_frame(&self) -> Option<DynamicImage> {
        let display = *self.display.lock();
        self.handle.grab(display).await
    }

    async fn parameter_min(&self, name: &str) -> Option<f64> {
        self.integer_range(name).await.map(|(min, _)| min)
    }

    async fn parameter_max(&self, name: &str) -> Option<f64> {
        self.integer_range(name).await.map(|(_, max)| max)
    }

    async fn parameter_current(&self, name: &str) -> Option<ParameterValue> {
        if !self.handle.is_connected() {
            return None;
        }
        if let Some(node) = integer_node(name) {
            let node = self.handle.with_camera(move |cam| cam.numeric(node)).await.ok()?;
            return Some(ParameterValue::Number(node.current.trunc()));
        }
        match name {
            "PixelFormat" => {
                let node = self
                    .handle
                    .with_camera(|cam| cam.enumeration("PixelFormat"))
                    .await
                    .ok()?;
                Some(ParameterValue::Number(f64::from(node.current)))
            }
            "BalanceWhiteAuto" => {
                let node = self
                    .handle
                    .with_camera(|cam| cam.enumeration("BalanceWhiteAuto"))
                    .await
                    .ok()?;
                let mode = WHITE_BALANCE_MODES
                    .get(node.current as usize)
                    .copied()
                    .unwrap_or("Off");
                Some(ParameterValue::from(mode))
            }
            DIGITAL_ZOOM => self.zoom.lock().map(ParameterValue::Number),
            _ => None,
        }
    }

    async fn set_parameter(&self, name: &str, value: &ParameterValue) -> CameraResult<()> {
        if !self.handle.is_connected() {
            return Err(CameraError::NotConnected);
        }
        let numeric = |parameter: &str| {
            value.as_f64().ok_or_else(|| CameraError::InvalidValue {
                parameter: parameter.to_string(),
                reason: format!("expected a number, got '{}'", value.as_text()),
            })
        };

        if let Some(node) = integer_node(name) {
            let v = numeric(node)?.trunc();
            self.handle.with_camera(move |cam| cam.set_numeric(node, v)).await?;
            match node {
                "Width" => self.handle.set_size(v as u32, self.handle.height()),
                "Height" => self.handle.set_size(self.handle.width(), v as u32),
                _ => {}
            }
            return Ok(());
        }

        match name {
            "PixelFormat" => {
                let v = numeric(name)? as u32;
                self.handle
                    .with_camera(move |cam| cam.set_enumeration("PixelFormat", v))
                    .await
            }
            "BalanceWhiteAuto" => {
                let v = white_balance_ordinal(value);
                self.handle
                    .with_camera(move |cam| cam.set_enumeration("BalanceWhiteAuto", v))
                    .await
            }
            DIGITAL_ZOOM => {
                let v = numeric(name)?;
                self.handle
                    .with_camera(move |cam| cam.set_numeric(DIGITAL_ZOOM, v))
                    .await?;
                *self.zoom.lock() = Some(v);
                Ok(())
            }
            other => Err(CameraError::UnsupportedParameter(other.to_string())),
        }
    }

    async fn save_settings(&self) -> CameraResult<()> {
        self.handle.with_camera(|cam| cam.save_user_set()).await
    }

    fn width(&self) -> u32 {
        self.handle.width()
    }

    fn height(&self) -> u32 {
        self.handle.height()
    }

    fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    fn is_streaming(&self) -> bool {
        self.handle.is_streaming()
    }

    fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = KNOWN_PARAMETERS.iter().map(|s| s.to_string()).collect();
        if self.zoom.lock().is_some() {
            names.push(DIGITAL_ZOOM.to_string());
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulated::{SimulatedDevice, SimulatedSdk};
    use crate::camera::Interface;

    fn sdk() -> Arc<SimulatedSdk> {
        Arc::new(SimulatedSdk::new(vec![
            SimulatedDevice::usb("MV-CS050-10UC", "U0001"),
            SimulatedDevice::gige("MV-CA050-10GC", "G0001", 0xC0A8_0114),
        ]))
    }

    #[tokio::test]
    async fn lists_usb_and_gige_devices() {
        let cam = HikrobotCamera::new(0, sdk(), Duration::from_millis(200));
        let devices = cam.discover().await;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].interface, Interface::Usb);
        assert_eq!(devices[1].interface, Interface::GigE);
        assert_eq!(devices[1].address.as_deref(), Some("192.168.1.20"));
    }

    #[tokio::test]
    async fn white_balance_round_trips_by_name() {
        let cam = HikrobotCamera::new(1, sdk(), Duration::from_millis(200));
        cam.connect().await.unwrap();

        cam.set_parameter("BalanceWhiteAuto", &ParameterValue::from("Once"))
            .await
            .unwrap();
        assert_eq!(
            cam.parameter_current("BalanceWhiteAuto").await,
            Some(ParameterValue::from("Once"))
        );

        cam.set_parameter("BalanceWhiteAuto", &ParameterValue::from("Bogus"))
            .await
            .unwrap();
        assert_eq!(
            cam.parameter_current("BalanceWhiteAuto").await,
            Some(ParameterValue::from("Off"))
        );
    }

    #[tokio::test]
    async fn digital_zoom_reports_last_write() {
        let cam = HikrobotCamera::new(0, sdk(), Duration::from_millis(200));
        cam.connect().await.unwrap();
        assert_eq!(cam.parameter_current("DigitalZoom").await, None);
        assert!(!cam.parameter_names().iter().any(|n| n == "DigitalZoom"));

        cam.set_parameter("DigitalZoom", &ParameterValue::Number(2.0)).await.unwrap();
        assert!(cam.set_parameter("DigitalZoom", &ParameterValue::Number(9.0)).await.is_err());
        assert_eq!(cam.parameter_current("DigitalZoom").await, Some(ParameterValue::Number(2.0)));
        assert!(cam.parameter_names().iter().any(|n| n == "DigitalZoom"));

        cam.disconnect().await.unwrap();
        assert_eq!(cam.parameter_current("DigitalZoom").await, None);
    }

    #[tokio::test]
    async fn getters_are_empty_before_connect() {
        let cam = HikrobotCamera::new(0, sdk(), Duration::from_millis(200));
        assert_eq!(cam.parameter_min("Gain").await, None);
        assert_eq!(cam.parameter_current("Width").await, None);
        assert_eq!(
            cam.set_parameter("Gain", &ParameterValue::Number(1.0)).await,
            Err(CameraError::NotConnected)
        );
    }

    #[tokio::test]
    async fn frames_fit_requested_resolution() {
        let cam = HikrobotCamera::new(0, sdk(), Duration::from_millis(200));
        cam.connect().await.unwrap();
        cam.start_stream(Some(640), Some(480)).await.unwrap();
        assert_eq!((cam.width(), cam.height()), (640, 480));

        let frame = cam.capture_frame().await.unwrap();
        assert!(frame.width() <= 640 && frame.height() <= 480);
        cam.disconnect().await.unwrap();
        assert!(!cam.is_streaming());
    }
}
