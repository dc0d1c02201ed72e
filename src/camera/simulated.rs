//! In-process vendor SDK.
//!
//! Backs `--simulate` and the test suite. Devices produce a gradient at
//! their configured resolution and keep a small node map so parameter
//! round-trips behave like real hardware. A device can only be opened once
//! at a time, like the vendor libraries.

use anyhow::{anyhow, bail, ensure, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::backend::{
    EnumNode, NumericNode, RawDeviceInfo, RawFrame, RawPixelFormat, SdkCamera, Transport,
    VendorSdk,
};
use super::CameraFamily;

/// GenICam code for packed RGB8.
const PIXEL_FORMAT_RGB8: u32 = 0x0218_0014;
/// GenICam code for Mono8.
const PIXEL_FORMAT_MONO8: u32 = 0x0108_0001;
const MIN_DIMENSION: u32 = 16;

/// Description of one simulated device.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    /// Model name reported by enumeration.
    pub model: String,
    /// Serial number reported by enumeration.
    pub serial: String,
    /// Transport layer.
    pub transport: Transport,
    /// Packed IPv4 address for GigE devices.
    pub ipv4: Option<u32>,
    /// Native sensor width.
    pub width: u32,
    /// Native sensor height.
    pub height: u32,
    /// Layout of produced buffers.
    pub pixel_format: RawPixelFormat,
    /// Artificial latency added to every grab.
    pub capture_delay: Duration,
}

impl SimulatedDevice {
    /// A 1920x1080 RGB USB device.
    pub fn usb(model: &str, serial: &str) -> Self {
        Self {
            model: model.to_string(),
            serial: serial.to_string(),
            transport: Transport::Usb,
            ipv4: None,
            width: 1920,
            height: 1080,
            pixel_format: RawPixelFormat::Rgb8,
            capture_delay: Duration::ZERO,
        }
    }

    /// A 1920x1080 RGB GigE device.
    pub fn gige(model: &str, serial: &str, ipv4: u32) -> Self {
        Self {
            transport: Transport::GigE,
            ipv4: Some(ipv4),
            ..Self::usb(model, serial)
        }
    }

    /// Overrides the native resolution.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Overrides the buffer layout.
    pub fn with_pixel_format(mut self, pixel_format: RawPixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    /// Adds latency to every grab.
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }
}

/// Simulated SDK holding a fixed set of devices.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSdk {
    devices: Vec<SimulatedDevice>,
    open: Arc<Mutex<HashSet<u32>>>,
}

impl SimulatedSdk {
    /// SDK exposing `devices` in order.
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        Self {
            devices,
            open: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// `count` devices with family-typical names at `width` x `height`.
    pub fn for_family(family: CameraFamily, count: u32, width: u32, height: u32) -> Self {
        let devices = (0..count)
            .map(|i| {
                let serial = format!("SIM-{}-{i:04}", family.as_str().to_uppercase());
                let device = match family {
                    CameraFamily::Ids => SimulatedDevice::usb("UI-3240CP-C-HQ", &serial),
                    CameraFamily::Mshot => SimulatedDevice::usb("MS60", &serial),
                    CameraFamily::Hikrobot => {
                        SimulatedDevice::gige("MV-CA050-10GC", &serial, 0xC0A8_010A + i)
                    }
                };
                device.with_resolution(width, height)
            })
            .collect();
        Self::new(devices)
    }

    /// Whether device `index` currently has an open handle.
    pub fn is_open(&self, index: u32) -> bool {
        self.open.lock().contains(&index)
    }
}

impl VendorSdk for SimulatedSdk {
    fn enumerate(&self) -> Result<Vec<RawDeviceInfo>> {
        Ok(self
            .devices
            .iter()
            .map(|d| RawDeviceInfo {
                model: Some(d.model.clone()),
                serial: Some(d.serial.clone()),
                transport: d.transport,
                ipv4: d.ipv4,
            })
            .collect())
    }

    fn open(&self, index: u32) -> Result<Box<dyn SdkCamera>> {
        let device = self
            .devices
            .get(index as usize)
            .ok_or_else(|| anyhow!("no simulated device at index {index}"))?;
        ensure!(
            self.open.lock().insert(index),
            "device {index} is already opened by another handle"
        );
        Ok(Box::new(SimulatedCamera::new(
            index,
            device.clone(),
            Arc::clone(&self.open),
        )))
    }
}

struct SimulatedCamera {
    index: u32,
    device: SimulatedDevice,
    open: Arc<Mutex<HashSet<u32>>>,
    closed: bool,
    acquiring: bool,
    frame: Option<(u32, u32, Vec<u8>)>,
    numeric: HashMap<&'static str, NumericNode>,
    enums: HashMap<&'static str, EnumNode>,
}

impl SimulatedCamera {
    fn new(index: u32, device: SimulatedDevice, open: Arc<Mutex<HashSet<u32>>>) -> Self {
        let node = |min: f64, max: f64, current: f64| NumericNode { min, max, current };
        let min_dim = f64::from(MIN_DIMENSION);
        let (width, height) = (f64::from(device.width), f64::from(device.height));
        let numeric = HashMap::from([
            ("Width", node(min_dim, width, width)),
            ("Height", node(min_dim, height, height)),
            ("ExposureTime", node(10.0, 1_000_000.0, 10_000.0)),
            ("Gain", node(0.0, 24.0, 0.0)),
            ("AcquisitionFrameRate", node(1.0, 60.0, 30.0)),
            ("DigitalZoom", node(1.0, 4.0, 1.0)),
        ]);
        let pixel_format = match device.pixel_format {
            RawPixelFormat::Mono8 => PIXEL_FORMAT_MONO8,
            RawPixelFormat::Other(code) => code,
            _ => PIXEL_FORMAT_RGB8,
        };
        let enums = HashMap::from([
            (
                "PixelFormat",
                EnumNode {
                    current: pixel_format,
                    entries: Vec::new(),
                },
            ),
            (
                "BalanceWhiteAuto",
                EnumNode {
                    current: 0,
                    entries: vec!["Off".into(), "Once".into(), "Continuous".into()],
                },
            ),
        ]);

        Self {
            index,
            device,
            open,
            closed: false,
            acquiring: false,
            frame: None,
            numeric,
            enums,
        }
    }

    fn size(&self) -> (u32, u32) {
        let read = |name: &str| self.numeric.get(name).map_or(0, |n| n.current as u32);
        (read("Width"), read("Height"))
    }

    /// Gradient test pattern, rebuilt only when the size changes.
    fn render(&mut self, width: u32, height: u32) -> Vec<u8> {
        if let Some((w, h, data)) = &self.frame {
            if (*w, *h) == (width, height) {
                return data.clone();
            }
        }
        let channels = match self.device.pixel_format {
            RawPixelFormat::Mono8 => 1,
            _ => 3,
        };
        let mut data = Vec::with_capacity((width * height * channels) as usize);
        for y in 0..height {
            let g = (y * 255 / height.max(1)) as u8;
            for x in 0..width {
                let r = (x * 255 / width.max(1)) as u8;
                if channels == 1 {
                    data.push(r / 2 + g / 2);
                } else {
                    data.extend_from_slice(&[r, g, 128]);
                }
            }
        }
        self.frame = Some((width, height, data.clone()));
        data
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(!self.closed, "handle for device {} is closed", self.index);
        Ok(())
    }
}

impl SdkCamera for SimulatedCamera {
    fn image_size(&self) -> (u32, u32) {
        self.size()
    }

    fn set_image_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.ensure_open()?;
        ensure!(!self.acquiring, "cannot change image size while acquiring");
        self.set_numeric("Width", f64::from(width))?;
        self.set_numeric("Height", f64::from(height))
    }

    fn start_acquisition(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.acquiring = true;
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        self.acquiring = false;
        Ok(())
    }

    fn grab(&mut self, timeout: Duration) -> Result<Option<RawFrame>> {
        self.ensure_open()?;
        ensure!(self.acquiring, "acquisition not started");

        let delay = self.device.capture_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay.min(timeout));
            if delay > timeout {
                return Ok(None);
            }
        }

        let (width, height) = self.size();
        let data = self.render(width, height);
        Ok(Some(RawFrame {
            width,
            height,
            pixel_format: self.device.pixel_format,
            data,
        }))
    }

    fn numeric(&self, name: &str) -> Result<NumericNode> {
        self.ensure_open()?;
        self.numeric
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("node '{name}' is not a numeric feature"))
    }

    fn set_numeric(&mut self, name: &str, value: f64) -> Result<()> {
        self.ensure_open()?;
        if matches!(name, "Width" | "Height") && self.acquiring {
            bail!("cannot change {name} while acquiring");
        }
        let node = self
            .numeric
            .get_mut(name)
            .ok_or_else(|| anyhow!("node '{name}' is not a numeric feature"))?;
        ensure!(
            (node.min..=node.max).contains(&value),
            "{name} value {value} outside [{}, {}]",
            node.min,
            node.max
        );
        node.current = value;
        Ok(())
    }

    fn enumeration(&self, name: &str) -> Result<EnumNode> {
        self.ensure_open()?;
        self.enums
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("node '{name}' is not an enumeration"))
    }

    fn set_enumeration(&mut self, name: &str, value: u32) -> Result<()> {
        self.ensure_open()?;
        let node = self
            .enums
            .get_mut(name)
            .ok_or_else(|| anyhow!("node '{name}' is not an enumeration"))?;
        ensure!(
            node.entries.is_empty() || (value as usize) < node.entries.len(),
            "{value} is not a valid {name} entry"
        );
        node.current = value;
        Ok(())
    }

    fn save_user_set(&mut self) -> Result<()> {
        self.ensure_open()
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.acquiring = false;
            self.open.lock().remove(&self.index);
        }
        Ok(())
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        if !self.closed {
            self.open.lock().remove(&self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_exclusive_until_close() {
        let sdk = SimulatedSdk::new(vec![SimulatedDevice::usb("UI", "1")]);
        let mut cam = sdk.open(0).unwrap();
        assert!(sdk.open(0).is_err());
        assert!(sdk.is_open(0));

        cam.close().unwrap();
        cam.close().unwrap();
        assert!(!sdk.is_open(0));
        assert!(sdk.open(0).is_ok());
    }

    #[test]
    fn grab_requires_acquisition() {
        let sdk = SimulatedSdk::new(vec![SimulatedDevice::usb("UI", "1").with_resolution(32, 16)]);
        let mut cam = sdk.open(0).unwrap();
        assert!(cam.grab(Duration::from_millis(10)).is_err());

        cam.start_acquisition().unwrap();
        let frame = cam.grab(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (32, 16));
        assert_eq!(frame.data.len(), 32 * 16 * 3);
    }

    #[test]
    fn slow_device_times_out() {
        let sdk = SimulatedSdk::new(vec![SimulatedDevice::usb("UI", "1")
            .with_resolution(32, 16)
            .with_capture_delay(Duration::from_millis(50))]);
        let mut cam = sdk.open(0).unwrap();
        cam.start_acquisition().unwrap();
        assert!(cam.grab(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn numeric_writes_are_range_checked() {
        let sdk = SimulatedSdk::new(vec![SimulatedDevice::usb("UI", "1")]);
        let mut cam = sdk.open(0).unwrap();
        assert!(cam.set_numeric("Gain", 99.0).is_err());
        cam.set_numeric("Gain", 12.0).unwrap();
        assert_eq!(cam.numeric("Gain").unwrap().current, 12.0);
        assert!(cam.set_image_size(4000, 100).is_err());
    }

    #[test]
    fn family_defaults() {
        let sdk = SimulatedSdk::for_family(CameraFamily::Hikrobot, 2, 640, 480);
        let listed = sdk.enumerate().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].transport, Transport::GigE);
        assert_eq!(listed[1].ipv4, Some(0xC0A8_010B));
    }
}
