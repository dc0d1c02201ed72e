//! Service configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. `config/camera_service.toml` (or the file given with `--config`)
//! 3. Environment variables prefixed with `CAMSVC_`
//!
//! Command-line flags are applied on top by the binary.
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! CAMSVC_SERVER__PORT=9000
//! CAMSVC_STREAMING__JPEG_QUALITY=75
//! CAMSVC_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use camera_service::config::ServiceConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig::load()?;
//!     println!("Listening on {}:{}", config.server.host, config.server.port);
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::camera::CameraFamily;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/camera_service.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CAMSVC_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed into the config shape.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value is outside its allowed range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// WebSocket listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Frame streaming settings
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Vendor SDK library locations
    #[serde(default)]
    pub sdk: SdkConfig,
    /// Simulated devices
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// WebSocket listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Concurrent client limit
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Delay between frames in milliseconds
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Bounded wait for a single buffer grab in milliseconds
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_ms: u64,
    /// Outbound message queue depth per connection
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// How long stop-stream waits for the task to finish, in milliseconds
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level filter used when `RUST_LOG` is unset (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

/// Where to look for one family's SDK library
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SdkPaths {
    /// Directories searched in order
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// Library file names accepted in those directories
    #[serde(default)]
    pub library_files: Vec<String>,
}

/// SDK library locations per family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkConfig {
    /// IDS uEye
    #[serde(default = "default_ids_paths")]
    pub ids: SdkPaths,
    /// Mshot
    #[serde(default = "default_mshot_paths")]
    pub mshot: SdkPaths,
    /// Hikrobot MVS
    #[serde(default = "default_hikrobot_paths")]
    pub hikrobot: SdkPaths,
}

/// Simulated device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Serve simulated devices instead of vendor SDKs
    #[serde(default)]
    pub enabled: bool,
    /// Sensor width in pixels
    #[serde(default = "default_sim_width")]
    pub width: u32,
    /// Sensor height in pixels
    #[serde(default = "default_sim_height")]
    pub height: u32,
    /// Devices exposed per family
    #[serde(default = "default_devices_per_family")]
    pub devices_per_family: u32,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_max_connections() -> usize {
    10
}

fn default_frame_interval() -> u64 {
    33
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_capture_timeout() -> u64 {
    1000
}

fn default_outbound_queue() -> usize {
    32
}

fn default_stop_grace() -> u64 {
    1500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sim_width() -> u32 {
    1920
}

fn default_sim_height() -> u32 {
    1080
}

fn default_devices_per_family() -> u32 {
    1
}

fn local_libs(family: &str) -> PathBuf {
    PathBuf::from("libs").join(family)
}

fn platform_paths(windows: &[&str], family: &str) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = if cfg!(windows) {
        windows.iter().map(PathBuf::from).collect()
    } else {
        vec![PathBuf::from("/usr/lib"), PathBuf::from("/usr/local/lib")]
    };
    paths.push(local_libs(family));
    paths
}

fn default_ids_paths() -> SdkPaths {
    SdkPaths {
        search_paths: platform_paths(
            &[
                r"C:\Program Files\IDS\uEye\Develop\Bin64",
                r"C:\Program Files (x86)\IDS\uEye\Develop\Bin64",
            ],
            "ids",
        ),
        library_files: vec!["ueye_api.dll".into(), "libueye_api.so".into()],
    }
}

fn default_mshot_paths() -> SdkPaths {
    SdkPaths {
        search_paths: platform_paths(
            &[r"C:\Program Files\Mshot", r"C:\Program Files (x86)\Mshot"],
            "mshot",
        ),
        library_files: vec!["mshot.dll".into(), "libmshot.so".into()],
    }
}

fn default_hikrobot_paths() -> SdkPaths {
    SdkPaths {
        search_paths: platform_paths(
            &[
                r"C:\Program Files\MVS\Development\Bin\x64",
                r"C:\Program Files (x86)\MVS\Development\Bin\x64",
                r"C:\Program Files\MVS\Development\Bin\Win64",
                r"C:\Program Files (x86)\MVS\Development\Bin\Win64",
                r"C:\Program Files (x86)\Common Files\MVS\Runtime\Win64_x64",
                r"C:\Program Files\Common Files\MVS\Runtime\Win64_x64",
            ],
            "hikrobot",
        ),
        library_files: vec!["MvCameraControl.dll".into(), "libMvCameraControl.so".into()],
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval(),
            jpeg_quality: default_jpeg_quality(),
            capture_timeout_ms: default_capture_timeout(),
            outbound_queue: default_outbound_queue(),
            stop_grace_ms: default_stop_grace(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            ids: default_ids_paths(),
            mshot: default_mshot_paths(),
            hikrobot: default_hikrobot_paths(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            width: default_sim_width(),
            height: default_sim_height(),
            devices_per_family: default_devices_per_family(),
        }
    }
}

impl StreamingConfig {
    /// Frame interval as a [`Duration`].
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Capture timeout as a [`Duration`].
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Stop grace period as a [`Duration`].
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl SdkConfig {
    /// Library locations for `family`.
    pub fn paths(&self, family: CameraFamily) -> &SdkPaths {
        match family {
            CameraFamily::Ids => &self.ids,
            CameraFamily::Mshot => &self.mshot,
            CameraFamily::Hikrobot => &self.hikrobot,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ServiceConfig {
    /// Load configuration from the default file and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the sources cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path plus the environment.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path)
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider stack, for callers that merge more on top.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(ServiceConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid port 0. Must be 1-65535".to_string(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }

        if !(1..=100).contains(&self.streaming.jpeg_quality) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid jpeg_quality {}. Must be 1-100",
                self.streaming.jpeg_quality
            )));
        }

        if self.streaming.frame_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "frame_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.streaming.capture_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "capture_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.streaming.outbound_queue == 0 {
            return Err(ConfigError::ValidationError(
                "outbound_queue must be at least 1".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.simulator.enabled && (self.simulator.width == 0 || self.simulator.height == 0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid simulator resolution {}x{}",
                self.simulator.width, self.simulator.height
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.streaming.jpeg_quality, 90);
        assert_eq!(config.streaming.frame_interval(), Duration::from_millis(33));
        assert_eq!(
            config.sdk.paths(CameraFamily::Hikrobot).library_files,
            vec!["MvCameraControl.dll", "libMvCameraControl.so"]
        );
    }

    #[test]
    fn test_invalid_quality() {
        let mut config = ServiceConfig::default();
        config.streaming.jpeg_quality = 0;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("jpeg_quality"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ServiceConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = ServiceConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100

[streaming]
jpeg_quality = 70

[simulator]
enabled = true
devices_per_family = 2
"#
        )
        .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = ServiceConfig::load_from(file.path()).expect("config");
            assert_eq!(config.server.port, 9100);
            assert_eq!(config.server.host, "127.0.0.1");
            assert_eq!(config.streaming.jpeg_quality, 70);
            assert_eq!(config.streaming.frame_interval_ms, 33);
            assert!(config.simulator.enabled);
            assert_eq!(config.simulator.devices_per_family, 2);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|jail| {
            let missing = jail.directory().join("nope.toml");
            let config = ServiceConfig::load_from(missing).expect("defaults");
            assert_eq!(config.server.port, 8765);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "camera_service.toml",
                r#"
[server]
port = 9100
"#,
            )?;
            jail.set_env("CAMSVC_SERVER__PORT", "9200");
            jail.set_env("CAMSVC_LOGGING__LEVEL", "debug");

            let config = ServiceConfig::load_from("camera_service.toml").expect("config");
            assert_eq!(config.server.port, 9200);
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_file_value_fails_validation() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("bad.toml", "[streaming]\njpeg_quality = 0\n")?;
            let err = ServiceConfig::load_from("bad.toml").unwrap_err();
            assert!(matches!(err, ConfigError::ValidationError(_)));
            Ok(())
        });
    }

    // Loading reads the process environment, so these run inside a Jail to
    // serialize with the tests that set CAMSVC_ variables.
    #[test]
    fn test_rendered_config_loads_back() {
        figment::Jail::expect_with(|jail| {
            let mut config = ServiceConfig::default();
            config.server.port = 9300;
            config.simulator.enabled = true;
            let rendered = toml::to_string_pretty(&config).expect("render");
            jail.create_file("rendered.toml", &rendered)?;

            let loaded = ServiceConfig::load_from("rendered.toml").expect("load");
            assert_eq!(loaded.server.port, 9300);
            assert!(loaded.simulator.enabled);
            assert_eq!(
                loaded.sdk.paths(CameraFamily::Ids).library_files,
                config.sdk.paths(CameraFamily::Ids).library_files
            );
            Ok(())
        });
    }

    #[test]
    fn test_shipped_config_is_valid() {
        figment::Jail::expect_with(|_jail| {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
            let config = ServiceConfig::load_from(path).expect("shipped config");
            assert_eq!(config.server.port, 8765);
            assert!(!config.simulator.enabled);
            Ok(())
        });
    }
}
