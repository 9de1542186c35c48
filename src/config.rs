use crate::backends::CameraSelector;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Highest frame rate a camera may be configured for
pub const MAX_CAMERA_FPS: u32 = 240;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SnapcamConfig {
    pub camera: CameraConfig,
    pub capture: CaptureConfig,
    pub storage: StorageConfig,
    pub permission: PermissionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Camera backend to use ("virtual" or "gstreamer")
    #[serde(default = "default_camera_backend")]
    pub backend: CameraBackendKind,

    /// Lens selected when the screen opens
    #[serde(default = "default_camera_selector")]
    pub selector: CameraSelector,

    /// Device index of the back camera (e.g., 0 for /dev/video0)
    #[serde(default = "default_back_index")]
    pub back_index: u32,

    /// Device index of the front camera
    #[serde(default = "default_front_index")]
    pub front_index: u32,

    /// Camera resolution (width, height)
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Frames per second
    #[serde(default = "default_camera_fps")]
    pub fps: u32,

    /// Number of attempts made to acquire and bind the device
    #[serde(default = "default_bind_retries")]
    pub bind_retries: u32,

    /// Base delay between binding attempts, doubled after each failure
    #[serde(default = "default_bind_retry_delay_ms")]
    pub bind_retry_delay_ms: u64,

    /// Upper bound for the doubled retry delay
    #[serde(default = "default_bind_retry_max_delay_ms")]
    pub bind_retry_max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CaptureConfig {
    /// How photos are taken from the device
    #[serde(default = "default_capture_strategy")]
    pub strategy: CaptureStrategy,

    /// Capture attempts running longer than this are reported as failed
    #[serde(default = "default_capture_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Directory where captured photos are written
    #[serde(default = "default_storage_path")]
    pub path: String,

    /// Write a JSON sidecar next to each captured photo
    #[serde(default = "default_save_metadata")]
    pub save_metadata: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PermissionConfig {
    /// Treat camera permission as granted at startup
    #[serde(default = "default_permission_granted")]
    pub granted: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CameraBackendKind {
    Virtual,
    Gstreamer,
}

/// Strategy used to turn the camera into a saved photo
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// Dedicated still-capture use case; preview stays bound
    StillCapture,
    /// Snapshot of the last preview frame; preview is unbound around the capture
    PreviewSnapshot,
}

impl CaptureStrategy {
    /// Whether the preview use case must release the device while capturing
    pub fn requires_exclusive_device(&self) -> bool {
        matches!(self, CaptureStrategy::PreviewSnapshot)
    }
}

impl CameraConfig {
    pub fn device_index(&self, selector: CameraSelector) -> u32 {
        match selector {
            CameraSelector::Back => self.back_index,
            CameraSelector::Front => self.front_index,
        }
    }

    /// Delay before the retry following the `failures`-th failed attempt:
    /// the base delay doubled per earlier failure, capped at the maximum
    pub fn bind_retry_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let delay_ms = self
            .bind_retry_delay_ms
            .saturating_mul(2_u64.saturating_pow(exponent));
        Duration::from_millis(delay_ms.min(self.bind_retry_max_delay_ms))
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl SnapcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("snapcam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("camera.backend", "virtual")?
            .set_default("camera.selector", "back")?
            .set_default("camera.back_index", default_back_index())?
            .set_default("camera.front_index", default_front_index())?
            .set_default(
                "camera.resolution",
                vec![default_camera_resolution().0, default_camera_resolution().1],
            )?
            .set_default("camera.fps", default_camera_fps())?
            .set_default("camera.bind_retries", default_bind_retries())?
            .set_default("camera.bind_retry_delay_ms", default_bind_retry_delay_ms())?
            .set_default(
                "camera.bind_retry_max_delay_ms",
                default_bind_retry_max_delay_ms(),
            )?
            .set_default("capture.strategy", "still_capture")?
            .set_default("capture.timeout_seconds", default_capture_timeout_seconds())?
            .set_default("storage.path", default_storage_path())?
            .set_default("storage.save_metadata", default_save_metadata())?
            .set_default("permission.granted", default_permission_granted())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Environment overrides, e.g. SNAPCAM_CAMERA__FPS=15
            .add_source(
                Environment::with_prefix("SNAPCAM")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: SnapcamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Camera resolution must be greater than 0".to_string(),
            ));
        }

        if self.camera.fps == 0 || self.camera.fps > MAX_CAMERA_FPS {
            return Err(ConfigError::Message(format!(
                "Camera fps must be between 1 and {}",
                MAX_CAMERA_FPS
            )));
        }

        if self.camera.bind_retry_max_delay_ms < self.camera.bind_retry_delay_ms {
            return Err(ConfigError::Message(
                "Camera bind_retry_max_delay_ms must not be below bind_retry_delay_ms".to_string(),
            ));
        }

        if self.camera.bind_retries == 0 {
            return Err(ConfigError::Message(
                "Camera bind_retries must allow at least one attempt".to_string(),
            ));
        }

        if self.capture.timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "Capture timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.storage.path.trim().is_empty() {
            return Err(ConfigError::Message(
                "Storage path must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for SnapcamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                backend: default_camera_backend(),
                selector: default_camera_selector(),
                back_index: default_back_index(),
                front_index: default_front_index(),
                resolution: default_camera_resolution(),
                fps: default_camera_fps(),
                bind_retries: default_bind_retries(),
                bind_retry_delay_ms: default_bind_retry_delay_ms(),
                bind_retry_max_delay_ms: default_bind_retry_max_delay_ms(),
            },
            capture: CaptureConfig {
                strategy: default_capture_strategy(),
                timeout_seconds: default_capture_timeout_seconds(),
            },
            storage: StorageConfig {
                path: default_storage_path(),
                save_metadata: default_save_metadata(),
            },
            permission: PermissionConfig {
                granted: default_permission_granted(),
            },
        }
    }
}

// Default value functions
fn default_camera_backend() -> CameraBackendKind {
    CameraBackendKind::Virtual
}
fn default_camera_selector() -> CameraSelector {
    CameraSelector::Back
}
fn default_back_index() -> u32 {
    0
}
fn default_front_index() -> u32 {
    1
}
fn default_camera_resolution() -> (u32, u32) {
    (640, 480)
}
fn default_camera_fps() -> u32 {
    30
}
fn default_bind_retries() -> u32 {
    3
}
fn default_bind_retry_delay_ms() -> u64 {
    500
}
fn default_bind_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_capture_strategy() -> CaptureStrategy {
    CaptureStrategy::StillCapture
}
fn default_capture_timeout_seconds() -> u64 {
    10
}

fn default_storage_path() -> String {
    "./photos".to_string()
}
fn default_save_metadata() -> bool {
    false
}

fn default_permission_granted() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SnapcamConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.camera.backend, CameraBackendKind::Virtual);
        assert_eq!(config.camera.selector, CameraSelector::Back);
        assert_eq!(config.capture.strategy, CaptureStrategy::StillCapture);
        assert_eq!(config.camera.device_index(CameraSelector::Front), 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SnapcamConfig::default();
        config.camera.resolution = (0, 0);

        // Should fail validation due to invalid resolution
        assert!(config.validate().is_err());

        config.camera.resolution = (640, 480);
        assert!(config.validate().is_ok());

        config.camera.bind_retries = 0;
        assert!(config.validate().is_err());

        config.camera.bind_retries = 1;
        config.storage.path = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[camera]
selector = "front"
fps = 15

[capture]
strategy = "preview_snapshot"

[storage]
path = "/tmp/snapcam-photos"
"#
        )
        .unwrap();

        let config = SnapcamConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.camera.selector, CameraSelector::Front);
        assert_eq!(config.camera.fps, 15);
        assert_eq!(config.camera.resolution, (640, 480));
        assert_eq!(config.capture.strategy, CaptureStrategy::PreviewSnapshot);
        assert!(config.capture.strategy.requires_exclusive_device());
        assert_eq!(config.storage.path, "/tmp/snapcam-photos");
        assert!(config.permission.granted);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = SnapcamConfig::load_from_file("/nonexistent/snapcam.toml").unwrap();
        assert_eq!(config.camera.fps, 30);
        assert_eq!(config.capture.timeout_seconds, 10);
    }

    #[test]
    fn test_printed_defaults_load_back() {
        let mut config = SnapcamConfig::default();
        config.camera.selector = CameraSelector::Front;
        config.capture.strategy = CaptureStrategy::PreviewSnapshot;

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "{}", toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = SnapcamConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.camera.selector, CameraSelector::Front);
        assert_eq!(loaded.capture.strategy, CaptureStrategy::PreviewSnapshot);
        assert_eq!(loaded.camera.bind_retries, config.camera.bind_retries);
    }

    #[test]
    fn test_frame_rate_must_be_realistic() {
        let mut config = SnapcamConfig::default();

        config.camera.fps = 2_000;
        assert!(config.validate().is_err());

        config.camera.fps = MAX_CAMERA_FPS;
        assert!(config.validate().is_ok());

        config.camera.fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_retry_delay_doubles_up_to_cap() {
        let mut config = SnapcamConfig::default().camera;
        config.bind_retry_delay_ms = 500;
        config.bind_retry_max_delay_ms = 3_000;

        assert_eq!(config.bind_retry_delay(1), Duration::from_millis(500));
        assert_eq!(config.bind_retry_delay(2), Duration::from_millis(1_000));
        assert_eq!(config.bind_retry_delay(3), Duration::from_millis(2_000));
        assert_eq!(config.bind_retry_delay(4), Duration::from_millis(3_000));
        assert_eq!(config.bind_retry_delay(60), Duration::from_millis(3_000));

        let mut invalid = SnapcamConfig::default();
        invalid.camera.bind_retry_max_delay_ms = invalid.camera.bind_retry_delay_ms - 1;
        assert!(invalid.validate().is_err());
    }
}
