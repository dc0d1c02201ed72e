//! Family → variant construction.
//!
//! This is the only place that branches on [`CameraFamily`]; the dispatcher
//! asks for an `Arc<dyn CameraDevice>` and never sees the concrete type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::backend::{MissingSdk, VendorSdk};
use super::hikrobot::HikrobotCamera;
use super::ids::IdsCamera;
use super::mshot::MshotCamera;
use super::simulated::SimulatedSdk;
use super::{CameraDevice, CameraFamily};

/// Default bounded wait for a single buffer grab.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Vendor SDK per family plus the shared capture timeout.
#[derive(Clone)]
pub struct DriverCatalog {
    sdks: HashMap<CameraFamily, Arc<dyn VendorSdk>>,
    capture_timeout: Duration,
}

impl Default for DriverCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_TIMEOUT)
    }
}

impl DriverCatalog {
    /// Catalog with no SDK bound for any family.
    pub fn new(capture_timeout: Duration) -> Self {
        Self {
            sdks: HashMap::new(),
            capture_timeout,
        }
    }

    /// Simulated devices for every family.
    pub fn simulated(devices_per_family: u32, width: u32, height: u32) -> Self {
        CameraFamily::ALL
            .into_iter()
            .fold(Self::default(), |catalog, family| {
                let sdk = SimulatedSdk::for_family(family, devices_per_family, width, height);
                catalog.with_sdk(family, Arc::new(sdk))
            })
    }

    /// Binds `sdk` to `family`.
    #[must_use]
    pub fn with_sdk(mut self, family: CameraFamily, sdk: Arc<dyn VendorSdk>) -> Self {
        self.sdks.insert(family, sdk);
        self
    }

    /// Overrides the capture timeout.
    #[must_use]
    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    /// Whether an SDK is bound for `family`.
    pub fn has_sdk(&self, family: CameraFamily) -> bool {
        self.sdks.contains_key(&family)
    }

    /// Builds a fresh, unconnected device of `family` for `index`.
    pub fn create(&self, family: CameraFamily, index: u32) -> Arc<dyn CameraDevice> {
        let sdk = self
            .sdks
            .get(&family)
            .cloned()
            .unwrap_or_else(|| Arc::new(MissingSdk) as Arc<dyn VendorSdk>);
        let timeout = self.capture_timeout;
        match family {
            CameraFamily::Ids => Arc::new(IdsCamera::new(index, sdk, timeout)),
            CameraFamily::Mshot => Arc::new(MshotCamera::new(index, sdk, timeout)),
            CameraFamily::Hikrobot => Arc::new(HikrobotCamera::new(index, sdk, timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_variant_for_each_family() {
        let catalog = DriverCatalog::simulated(1, 64, 48);
        for family in CameraFamily::ALL {
            let device = catalog.create(family, 0);
            assert_eq!(device.family(), family);
            assert_eq!(device.discover().await.len(), 1);
        }
    }

    #[tokio::test]
    async fn unbound_family_discovers_nothing() {
        let catalog = DriverCatalog::default();
        assert!(!catalog.has_sdk(CameraFamily::Ids));
        let device = catalog.create(CameraFamily::Ids, 0);
        assert!(device.discover().await.is_empty());
        assert!(device.connect().await.is_err());
    }
}
