//! Shared open-handle bookkeeping for the SDK-backed variants.
//!
//! Vendor calls block, so every call into an [`SdkCamera`] goes through
//! `spawn_blocking` with the handle behind an async mutex, the same way the
//! serial adapters keep their port.

use image::DynamicImage;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::backend::{format_ipv4, RawDeviceInfo, SdkCamera, Transport, VendorSdk};
use super::decode::{decode_raw, fit_to_display};
use super::{CameraError, CameraFamily, CameraResult, DeviceDescriptor, Interface};

/// Extra slack on top of the SDK grab timeout before the async side gives up.
const GRAB_SLACK: Duration = Duration::from_millis(250);

pub(crate) struct DeviceHandle {
    family: CameraFamily,
    index: u32,
    sdk: Arc<dyn VendorSdk>,
    camera: Arc<Mutex<Option<Box<dyn SdkCamera>>>>,
    width: AtomicU32,
    height: AtomicU32,
    connected: AtomicBool,
    streaming: AtomicBool,
    capture_timeout: Duration,
}

impl DeviceHandle {
    pub(crate) fn new(
        family: CameraFamily,
        index: u32,
        sdk: Arc<dyn VendorSdk>,
        capture_timeout: Duration,
    ) -> Self {
        Self {
            family,
            index,
            sdk,
            camera: Arc::new(Mutex::new(None)),
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            capture_timeout,
        }
    }

    pub(crate) fn family(&self) -> CameraFamily {
        self.family
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn width(&self) -> u32 {
        self.width.load(Ordering::Acquire)
    }

    pub(crate) fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    pub(crate) fn set_size(&self, width: u32, height: u32) {
        self.width.store(width, Ordering::Release);
        self.height.store(height, Ordering::Release);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub(crate) fn mark_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    /// Lists devices, keeping those `accept` admits. Never fails.
    pub(crate) async fn discover(
        &self,
        accept: fn(&RawDeviceInfo) -> bool,
    ) -> Vec<DeviceDescriptor> {
        let sdk = Arc::clone(&self.sdk);
        let family = self.family;
        let listed = tokio::task::spawn_blocking(move || sdk.enumerate()).await;

        let raw = match listed {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(%family, "Device enumeration failed: {e:#}");
                return Vec::new();
            }
            Err(e) => {
                warn!(%family, "Enumeration task failed: {e}");
                return Vec::new();
            }
        };

        raw.iter()
            .enumerate()
            .filter(|(_, info)| accept(info))
            .map(|(i, info)| describe(family, i as u32, info))
            .collect()
    }

    /// Runs `f` against the open handle on the blocking pool.
    pub(crate) async fn with_camera<F, R>(&self, f: F) -> CameraResult<R>
    where
        F: FnOnce(&mut dyn SdkCamera) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let camera = Arc::clone(&self.camera);
        tokio::task::spawn_blocking(move || {
            let mut guard = camera.blocking_lock();
            match guard.as_mut() {
                Some(cam) => f(cam.as_mut()).map_err(CameraError::sdk),
                None => Err(CameraError::NotConnected),
            }
        })
        .await
        .map_err(|e| CameraError::Sdk(format!("SDK call panicked or was cancelled: {e}")))?
    }

    /// Opens the device at this handle's index. Already open is success.
    pub(crate) async fn open(&self, accept: fn(&RawDeviceInfo) -> bool) -> CameraResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let sdk = Arc::clone(&self.sdk);
        let index = self.index;
        let opened = tokio::task::spawn_blocking(move || -> CameraResult<Box<dyn SdkCamera>> {
            let devices = sdk.enumerate().map_err(CameraError::sdk)?;
            match devices.get(index as usize) {
                Some(info) if accept(info) => sdk.open(index).map_err(CameraError::sdk),
                _ => Err(CameraError::DeviceNotFound(index)),
            }
        })
        .await
        .map_err(|e| CameraError::Sdk(format!("Open task failed: {e}")))??;

        let (width, height) = opened.image_size();
        *self.camera.lock().await = Some(opened);
        self.set_size(width, height);
        self.connected.store(true, Ordering::Release);
        debug!(family = %self.family, index, width, height, "Device opened");
        Ok(())
    }

    /// Stops acquisition if running and releases the handle.
    ///
    /// State is cleared even when the SDK reports an error on the way down.
    pub(crate) async fn close(&self) -> CameraResult<()> {
        let stop_result = self.stop().await;
        let taken = self.camera.lock().await.take();
        self.connected.store(false, Ordering::Release);
        self.streaming.store(false, Ordering::Release);

        let Some(mut camera) = taken else {
            return Ok(());
        };
        let close_result = tokio::task::spawn_blocking(move || camera.close())
            .await
            .map_err(|e| CameraError::Sdk(format!("Close task failed: {e}")))?
            .map_err(CameraError::sdk);

        debug!(family = %self.family, index = self.index, "Device closed");
        stop_result.and(close_result)
    }

    /// Reconfigures the image size when given, then starts acquisition.
    pub(crate) async fn start(&self, size: Option<(u32, u32)>) -> CameraResult<()> {
        if !self.is_connected() {
            return Err(CameraError::NotConnected);
        }
        let restart = self.is_streaming();
        let (width, height) = self
            .with_camera(move |cam| {
                if restart {
                    cam.stop_acquisition()?;
                }
                if let Some((w, h)) = size {
                    cam.set_image_size(w, h)?;
                }
                cam.start_acquisition()?;
                Ok(cam.image_size())
            })
            .await?;
        self.set_size(width, height);
        self.mark_streaming(true);
        Ok(())
    }

    /// Stops acquisition. No-op when not streaming.
    pub(crate) async fn stop(&self) -> CameraResult<()> {
        if !self.streaming.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        match self.with_camera(|cam| cam.stop_acquisition()).await {
            Err(CameraError::NotConnected) => Ok(()),
            other => other,
        }
    }

    /// Grabs and decodes one frame, optionally fitted to `display`.
    pub(crate) async fn grab(&self, display: Option<(u32, u32)>) -> Option<DynamicImage> {
        if !self.is_streaming() {
            return None;
        }
        let timeout = self.capture_timeout;
        let grabbed = self.with_camera(move |cam| {
            let frame = cam.grab(timeout)?;
            Ok(frame.and_then(decode_raw).map(|img| match display {
                Some(d) => fit_to_display(img, d),
                None => img,
            }))
        });

        match tokio::time::timeout(timeout + GRAB_SLACK, grabbed).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                debug!(family = %self.family, index = self.index, "Capture failed: {e}");
                None
            }
            Err(_) => {
                debug!(family = %self.family, index = self.index, "Capture timed out");
                None
            }
        }
    }
}

fn describe(family: CameraFamily, index: u32, info: &RawDeviceInfo) -> DeviceDescriptor {
    let (interface, address) = match info.transport {
        Transport::Usb => (Interface::Usb, None),
        Transport::GigE => (Interface::GigE, info.ipv4.map(format_ipv4)),
    };
    DeviceDescriptor {
        index,
        family,
        model: info
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("{} Camera {index}", family_label(family))),
        serial: info
            .serial
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| index.to_string()),
        interface,
        address,
    }
}

fn family_label(family: CameraFamily) -> &'static str {
    match family {
        CameraFamily::Ids => "IDS",
        CameraFamily::Mshot => "Mshot",
        CameraFamily::Hikrobot => "Hikrobot",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulated::{SimulatedDevice, SimulatedSdk};
    use tokio_test::{assert_err, assert_ok};

    fn any(_: &RawDeviceInfo) -> bool {
        true
    }

    fn usb_only(info: &RawDeviceInfo) -> bool {
        info.transport == Transport::Usb
    }

    #[test]
    fn descriptor_falls_back_to_generated_names() {
        let info = RawDeviceInfo {
            model: None,
            serial: Some(String::new()),
            transport: Transport::Usb,
            ipv4: None,
        };
        let d = describe(CameraFamily::Ids, 2, &info);
        assert_eq!(d.model, "IDS Camera 2");
        assert_eq!(d.serial, "2");
        assert_eq!(d.address, None);
    }

    #[test]
    fn gige_descriptor_carries_address() {
        let info = RawDeviceInfo {
            model: Some("MV-CA050-10GC".into()),
            serial: Some("K0001".into()),
            transport: Transport::GigE,
            ipv4: Some(0xC0A8_010A),
        };
        let d = describe(CameraFamily::Hikrobot, 0, &info);
        assert_eq!(d.interface, Interface::GigE);
        assert_eq!(d.address.as_deref(), Some("192.168.1.10"));
    }

    #[tokio::test]
    async fn lifecycle_tracks_flags_and_size() {
        let sdk = Arc::new(SimulatedSdk::new(vec![
            SimulatedDevice::usb("A", "1").with_resolution(80, 60),
        ]));
        let timeout = Duration::from_millis(200);
        let handle = DeviceHandle::new(CameraFamily::Mshot, 0, sdk.clone(), timeout);

        assert_err!(handle.start(None).await);
        assert!(handle.grab(None).await.is_none());

        assert_ok!(handle.open(any).await);
        assert!(handle.is_connected());
        assert_eq!((handle.width(), handle.height()), (80, 60));

        assert_ok!(handle.start(Some((40, 30))).await);
        assert!(handle.is_streaming());
        let frame = handle.grab(Some((20, 20))).await.unwrap();
        assert_eq!((frame.width(), frame.height()), (20, 15));

        assert_ok!(handle.close().await);
        assert!(!handle.is_connected() && !handle.is_streaming());
        assert!(!sdk.is_open(0));
        assert_ok!(handle.stop().await);
    }

    #[tokio::test]
    async fn open_rejects_filtered_transport() {
        let sdk = Arc::new(SimulatedSdk::new(vec![SimulatedDevice::gige("G", "1", 0x0A00_0001)]));
        let handle = DeviceHandle::new(CameraFamily::Ids, 0, sdk, Duration::from_millis(200));
        assert_eq!(handle.open(usb_only).await, Err(CameraError::DeviceNotFound(0)));
        assert!(handle.discover(usb_only).await.is_empty());
        assert_eq!(handle.discover(any).await.len(), 1);
    }
}
