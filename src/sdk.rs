//! SDK availability provider.
//!
//! Selecting a family annotates the reply with whether its vendor library is
//! present. The answer never blocks the protocol; it only predicts whether
//! discovery and connect can succeed.

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::camera::CameraFamily;
use crate::config::SdkConfig;

/// Reports which vendor SDKs can be used.
pub trait SdkAvailability: Send + Sync {
    /// Availability of every family.
    fn check_availability(&self) -> HashMap<CameraFamily, bool>;

    /// Prepares `family` for use. Returns whether the SDK is usable.
    fn initialize(&self, family: CameraFamily) -> bool;
}

/// Looks for vendor libraries on disk.
#[derive(Debug, Clone)]
pub struct LibraryProbe {
    config: SdkConfig,
}

impl LibraryProbe {
    /// Probe using the configured search paths.
    pub fn new(config: SdkConfig) -> Self {
        Self { config }
    }

    /// First configured library file found under a configured search path.
    pub fn find_library(&self, family: CameraFamily) -> Option<PathBuf> {
        let paths = self.config.paths(family);
        paths
            .search_paths
            .iter()
            .filter(|dir| dir.is_dir())
            .flat_map(|dir| paths.library_files.iter().map(move |file| dir.join(file)))
            .find(|candidate| candidate.is_file())
    }
}

impl SdkAvailability for LibraryProbe {
    fn check_availability(&self) -> HashMap<CameraFamily, bool> {
        CameraFamily::ALL
            .into_iter()
            .map(|family| (family, self.find_library(family).is_some()))
            .collect()
    }

    fn initialize(&self, family: CameraFamily) -> bool {
        match self.find_library(family) {
            Some(path) => {
                info!(%family, path = %path.display(), "SDK library found");
                true
            }
            None => {
                warn!(%family, "SDK library not found in configured search paths");
                false
            }
        }
    }
}

/// Fixed availability answers, used with simulated devices.
#[derive(Debug, Clone, Default)]
pub struct StaticAvailability {
    available: HashMap<CameraFamily, bool>,
}

impl StaticAvailability {
    /// Every family available.
    pub fn all() -> Self {
        Self {
            available: CameraFamily::ALL.into_iter().map(|f| (f, true)).collect(),
        }
    }

    /// Sets the answer for one family.
    #[must_use]
    pub fn with(mut self, family: CameraFamily, available: bool) -> Self {
        self.available.insert(family, available);
        self
    }
}

impl SdkAvailability for StaticAvailability {
    fn check_availability(&self) -> HashMap<CameraFamily, bool> {
        CameraFamily::ALL
            .into_iter()
            .map(|f| (f, self.available.get(&f).copied().unwrap_or(false)))
            .collect()
    }

    fn initialize(&self, family: CameraFamily) -> bool {
        let available = self.available.get(&family).copied().unwrap_or(false);
        debug!(%family, available, "Static SDK availability");
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SdkPaths;
    use tracing_test::traced_test;

    fn probe_with(dir: &std::path::Path, file: &str) -> LibraryProbe {
        let paths = SdkPaths {
            search_paths: vec![dir.join("missing"), dir.to_path_buf()],
            library_files: vec!["ueye_api.dll".into(), file.into()],
        };
        LibraryProbe::new(SdkConfig {
            ids: paths,
            mshot: SdkPaths::default(),
            hikrobot: SdkPaths::default(),
        })
    }

    #[test]
    fn finds_library_in_search_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libueye_api.so"), b"").unwrap();

        let probe = probe_with(dir.path(), "libueye_api.so");
        assert_eq!(
            probe.find_library(CameraFamily::Ids),
            Some(dir.path().join("libueye_api.so"))
        );
        assert!(probe.initialize(CameraFamily::Ids));
        assert!(!probe.initialize(CameraFamily::Mshot));

        let map = probe.check_availability();
        assert_eq!(map.get(&CameraFamily::Ids), Some(&true));
        assert_eq!(map.get(&CameraFamily::Hikrobot), Some(&false));
    }

    #[test]
    #[traced_test]
    fn missing_library_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let probe = probe_with(dir.path(), "libueye_api.so");
        assert_eq!(probe.find_library(CameraFamily::Ids), None);
        assert!(!probe.initialize(CameraFamily::Ids));
        assert!(logs_contain("SDK library not found"));
    }

    #[test]
    fn static_availability() {
        let availability = StaticAvailability::all().with(CameraFamily::Mshot, false);
        assert!(availability.initialize(CameraFamily::Ids));
        assert!(!availability.initialize(CameraFamily::Mshot));
        assert_eq!(availability.check_availability().len(), 3);
    }
}
