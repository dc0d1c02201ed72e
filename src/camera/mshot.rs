//! Mshot variant. Parameters are passed to the SDK by name.
//!
//! Any node the SDK accepts can be written, so names outside the standard set
//! are remembered once written and reported by `get-current` from then on.

use async_trait::async_trait;
use image::DynamicImage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::backend::{RawDeviceInfo, VendorSdk};
use super::handle::DeviceHandle;
use super::{
    CameraDevice, CameraError, CameraFamily, CameraResult, DeviceDescriptor, ParameterValue,
    KNOWN_PARAMETERS,
};

fn any_device(_: &RawDeviceInfo) -> bool {
    true
}

/// Mshot microscope camera.
pub struct MshotCamera {
    handle: DeviceHandle,
    extra_parameters: Mutex<Vec<String>>,
}

impl MshotCamera {
    /// Creates an unconnected instance for device `index`.
    pub fn new(index: u32, sdk: Arc<dyn VendorSdk>, capture_timeout: Duration) -> Self {
        Self {
            handle: DeviceHandle::new(CameraFamily::Mshot, index, sdk, capture_timeout),
            extra_parameters: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CameraDevice for MshotCamera {
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
        self.extra_parameters.lock().clear();
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
        let name = name.to_string();
        let node = self.handle.with_camera(move |cam| cam.numeric(&name)).await.ok()?;
        Some(node.min)
    }

    async fn parameter_max(&self, name: &str) -> Option<f64> {
        let name = name.to_string();
        let node = self.handle.with_camera(move |cam| cam.numeric(&name)).await.ok()?;
        Some(node.max)
    }

    async fn parameter_current(&self, name: &str) -> Option<ParameterValue> {
        let name = name.to_string();
        self.handle
            .with_camera(move |cam| {
                if let Ok(node) = cam.numeric(&name) {
                    return Ok(ParameterValue::Number(node.current));
                }
                let node = cam.enumeration(&name)?;
                Ok(match node.entries.get(node.current as usize) {
                    Some(entry) => ParameterValue::Text(entry.clone()),
                    None => ParameterValue::Number(f64::from(node.current)),
                })
            })
            .await
            .ok()
    }

    async fn set_parameter(&self, name: &str, value: &ParameterValue) -> CameraResult<()> {
        let parameter = name.to_string();
        let value = value.clone();
        let result = self
            .handle
            .with_camera(move |cam| match value {
                ParameterValue::Number(v) if cam.numeric(&parameter).is_ok() => {
                    cam.set_numeric(&parameter, v)
                }
                ParameterValue::Number(v) => cam.set_enumeration(&parameter, v as u32),
                ParameterValue::Text(text) => {
                    if let Ok(v) = text.trim().parse::<f64>() {
                        if cam.numeric(&parameter).is_ok() {
                            return cam.set_numeric(&parameter, v);
                        }
                    }
                    let node = cam.enumeration(&parameter)?;
                    let ordinal = node
                        .entries
                        .iter()
                        .position(|e| e.eq_ignore_ascii_case(&text))
                        .ok_or_else(|| {
                            anyhow::anyhow!("'{text}' is not a valid {parameter} entry")
                        })?;
                    cam.set_enumeration(&parameter, ordinal as u32)
                }
            })
            .await;

        if result.is_ok() {
            self.remember(name);
            self.refresh_size(name).await;
        }
        result
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
        KNOWN_PARAMETERS
            .iter()
            .map(|s| s.to_string())
            .chain(self.extra_parameters.lock().iter().cloned())
            .collect()
    }
}

impl MshotCamera {
    fn remember(&self, name: &str) {
        if KNOWN_PARAMETERS.contains(&name) {
            return;
        }
        let mut extra = self.extra_parameters.lock();
        if !extra.iter().any(|n| n == name) {
            extra.push(name.to_string());
        }
    }

    async fn refresh_size(&self, name: &str) {
        if !matches!(name, "Width" | "Height") {
            return;
        }
        if let Ok((w, h)) = self.handle.with_camera(|cam| Ok(cam.image_size())).await {
            self.handle.set_size(w, h);
        }
    }
}
