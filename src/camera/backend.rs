//! Vendor SDK boundary.
//!
//! Every vendor library exposes roughly the same things: device enumeration,
//! an open handle, image-size and acquisition control, a bounded-wait buffer
//! grab, and a node map of float / enum features. These two traits are that
//! shared surface. Device variants translate the uniform [`super::CameraDevice`]
//! contract onto them with their own vendor rules.
//!
//! Implementations wrap blocking C APIs, so variants call into them from
//! `spawn_blocking`.

use anyhow::Result;
use std::time::Duration;

/// Transport layer reported by enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// USB device.
    Usb,
    /// GigE Vision device.
    GigE,
}

/// Raw enumeration record as reported by the SDK.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDeviceInfo {
    /// Model name, if the SDK reports one.
    pub model: Option<String>,
    /// Serial number, if the SDK reports one.
    pub serial: Option<String>,
    /// Transport layer.
    pub transport: Transport,
    /// Current IPv4 address (big-endian packed) for GigE devices.
    pub ipv4: Option<u32>,
}

/// Pixel layout of a grabbed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPixelFormat {
    /// 8-bit monochrome.
    Mono8,
    /// 8-bit RGB, packed.
    Rgb8,
    /// 8-bit BGR, packed.
    Bgr8,
    /// Vendor code the boundary does not know.
    Other(u32),
}

/// One grabbed buffer, copied out of SDK memory.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel layout.
    pub pixel_format: RawPixelFormat,
    /// Pixel bytes, row-major.
    pub data: Vec<u8>,
}

/// Numeric feature node (min/max/current).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericNode {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
    /// Current value.
    pub current: f64,
}

/// Enumeration feature node.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumNode {
    /// Current ordinal.
    pub current: u32,
    /// Symbolic names of the valid ordinals.
    pub entries: Vec<String>,
}

/// A vendor SDK: enumeration plus a way to open handles.
pub trait VendorSdk: Send + Sync {
    /// Lists attached devices in SDK index order.
    fn enumerate(&self) -> Result<Vec<RawDeviceInfo>>;

    /// Opens the device at `index` with exclusive access.
    fn open(&self, index: u32) -> Result<Box<dyn SdkCamera>>;
}

/// An open SDK handle.
pub trait SdkCamera: Send {
    /// Current image size.
    fn image_size(&self) -> (u32, u32);

    /// Reconfigures the image size.
    fn set_image_size(&mut self, width: u32, height: u32) -> Result<()>;

    /// Starts acquisition.
    fn start_acquisition(&mut self) -> Result<()>;

    /// Stops acquisition.
    fn stop_acquisition(&mut self) -> Result<()>;

    /// Waits up to `timeout` for the next buffer. `Ok(None)` on timeout.
    fn grab(&mut self, timeout: Duration) -> Result<Option<RawFrame>>;

    /// Reads a numeric feature.
    fn numeric(&self, name: &str) -> Result<NumericNode>;

    /// Writes a numeric feature.
    fn set_numeric(&mut self, name: &str, value: f64) -> Result<()>;

    /// Reads an enumeration feature.
    fn enumeration(&self, name: &str) -> Result<EnumNode>;

    /// Writes an enumeration feature by ordinal.
    fn set_enumeration(&mut self, name: &str, value: u32) -> Result<()>;

    /// Stores the current settings in the device's user set.
    fn save_user_set(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases the handle. Must be safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

/// Stand-in for a family whose SDK is not installed.
///
/// Enumeration succeeds with no devices, opening always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct MissingSdk;

impl VendorSdk for MissingSdk {
    fn enumerate(&self) -> Result<Vec<RawDeviceInfo>> {
        Ok(Vec::new())
    }

    fn open(&self, index: u32) -> Result<Box<dyn SdkCamera>> {
        anyhow::bail!("SDK not loaded; cannot open device {index}")
    }
}

/// Renders a packed IPv4 address as dotted quad.
pub fn format_ipv4(ip: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        (ip >> 24) & 0xFF,
        (ip >> 16) & 0xFF,
        (ip >> 8) & 0xFF,
        ip & 0xFF
    )
}
