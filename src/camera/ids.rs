//! IDS uEye variant.
//!
//! uEye exposes exposure as a float range and gain as an integer range; the
//! resolution is read back from the sensor on open. Only USB devices are
//! enumerated.

use async_trait::async_trait;
use image::DynamicImage;
use std::sync::Arc;
use std::time::Duration;

use super::backend::{RawDeviceInfo, Transport, VendorSdk};
use super::handle::DeviceHandle;
use super::{
    CameraDevice, CameraError, CameraFamily, CameraResult, DeviceDescriptor, ParameterValue,
};

const EXPOSURE: &str = "ExposureTime";
const GAIN: &str = "Gain";

fn usb_only(info: &RawDeviceInfo) -> bool {
    info.transport == Transport::Usb
}

/// IDS uEye camera.
pub struct IdsCamera {
    handle: DeviceHandle,
}

impl IdsCamera {
    /// Creates an unconnected instance for device `index`.
    pub fn new(index: u32, sdk: Arc<dyn VendorSdk>, capture_timeout: Duration) -> Self {
        Self {
            handle: DeviceHandle::new(CameraFamily::Ids, index, sdk, capture_timeout),
        }
    }

    async fn range(&self, name: &'static str) -> Option<(f64, f64)> {
        if !matches!(name, EXPOSURE | GAIN) {
            return None;
        }
        let node = self.handle.with_camera(move |cam| cam.numeric(name)).await.ok()?;
        if name == GAIN {
            Some((node.min.trunc(), node.max.trunc()))
        } else {
            Some((node.min, node.max))
        }
    }
}

fn known(name: &str) -> Option<&'static str> {
    match name {
        EXPOSURE => Some(EXPOSURE),
        GAIN => Some(GAIN),
        _ => None,
    }
}

#[async_trait]
impl CameraDevice for IdsCamera {
    fn family(&self) -> CameraFamily {
        self.handle.family()
    }

    fn index(&self) -> u32 {
        self.handle.index()
    }

    async fn discover(&self) -> Vec<DeviceDescriptor> {
        self.handle.discover(usb_only).await
    }

    async fn connect(&self) -> CameraResult<()> {
        self.handle.open(usb_only).await
    }

    async fn disconnect(&self) -> CameraResult<()> {
        self.handle.close().await
    }

    async fn start_stream(&self, width: Option<u32>, height: Option<u32>) -> CameraResult<()> {
        self.handle.start(width.zip(height)).await
    }

    async fn stop_stream(&self) -> CameraResult<()> {
        self.handle.stop().await
    }

    async fn capture_frame(&self) -> Option<DynamicImage> {
        self.handle.grab(None).await
    }

    async fn parameter_min(&self, name: &str) -> Option<f64> {
        self.range(known(name)?).await.map(|(min, _)| min)
    }

    async fn parameter_max(&self, name: &str) -> Option<f64> {
        self.range(known(name)?).await.map(|(_, max)| max)
    }

    async fn parameter_current(&self, name: &str) -> Option<ParameterValue> {
        match name {
            "Width" if self.handle.is_connected() => Some(f64::from(self.handle.width()).into()),
            "Height" if self.handle.is_connected() => Some(f64::from(self.handle.height()).into()),
            _ => {
                let name = known(name)?;
                let node = self.handle.with_camera(move |cam| cam.numeric(name)).await.ok()?;
                let current = if name == GAIN { node.current.trunc() } else { node.current };
                Some(current.into())
            }
        }
    }

    async fn set_parameter(&self, name: &str, value: &ParameterValue) -> CameraResult<()> {
        let Some(name) = known(name) else {
            return Err(CameraError::UnsupportedParameter(name.to_string()));
        };
        let raw = value.as_f64().ok_or_else(|| CameraError::InvalidValue {
            parameter: name.to_string(),
            reason: format!("expected a number, got '{}'", value.as_text()),
        })?;
        let raw = if name == GAIN { raw.trunc() } else { raw };
        self.handle
            .with_camera(move |cam| cam.set_numeric(name, raw))
            .await
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulated::{SimulatedDevice, SimulatedSdk};

    fn camera(devices: Vec<SimulatedDevice>) -> IdsCamera {
        IdsCamera::new(0, Arc::new(SimulatedSdk::new(devices)), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn gain_is_reported_as_integer() {
        let cam = camera(vec![SimulatedDevice::usb("UI-3240CP", "4102")]);
        cam.connect().await.unwrap();

        cam.set_parameter("Gain", &ParameterValue::Number(7.8)).await.unwrap();
        assert_eq!(cam.parameter_current("Gain").await, Some(ParameterValue::Number(7.0)));

        cam.set_parameter("ExposureTime", &ParameterValue::Number(1250.5)).await.unwrap();
        assert_eq!(
            cam.parameter_current("ExposureTime").await,
            Some(ParameterValue::Number(1250.5))
        );
    }

    #[tokio::test]
    async fn unknown_parameters_are_rejected() {
        let cam = camera(vec![SimulatedDevice::usb("UI-3240CP", "4102")]);
        cam.connect().await.unwrap();

        assert_eq!(cam.parameter_min("PixelFormat").await, None);
        assert!(matches!(
            cam.set_parameter("PixelFormat", &ParameterValue::Number(1.0)).await,
            Err(CameraError::UnsupportedParameter(_))
        ));
    }

    #[tokio::test]
    async fn gige_devices_are_not_listed() {
        let cam = camera(vec![SimulatedDevice::gige("MV-CA050", "K1", 0xC0A8_0102)]);
        assert!(cam.discover().await.is_empty());
        assert_eq!(cam.connect().await, Err(CameraError::DeviceNotFound(0)));
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_noop() {
        let cam = camera(vec![]);
        assert!(cam.disconnect().await.is_ok());
        assert!(cam.stop_stream().await.is_ok());
        assert!(!cam.is_connected());
    }
}
