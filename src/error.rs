use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Camera permission denied")]
    PermissionDenied,

    #[error("System error: {message}")]
    System { message: String },
}

/// Errors raised by camera backends while acquiring or binding a device
#[derive(Error, Debug, Clone)]
pub enum CameraError {
    #[error("Failed to open camera device {device}: {details}")]
    DeviceOpen { device: String, details: String },

    #[error("Failed to bind camera use cases: {details}")]
    DeviceBindingFailed { details: String },

    #[error("Camera device is busy: {details}")]
    DeviceBusy { details: String },

    #[error("Camera configuration error: {details}")]
    Configuration { details: String },
}

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("{reason}")]
    Failed { reason: String },

    #[error("Capture cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl SnapcamError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }
}

impl CameraError {
    /// Whether another binding attempt can reasonably succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CameraError::Configuration { .. })
    }
}

pub type Result<T> = std::result::Result<T, SnapcamError>;
