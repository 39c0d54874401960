use thiserror::Error;

/// Failure to obtain media from the capture platform.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The user or the platform refused access to the device.
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),
    /// No device satisfies the requested constraints.
    #[error("no matching capture device: {0}")]
    NotFound(String),
    #[error("capture platform error: {0}")]
    Platform(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room join failed: {0}")]
    JoinFailed(String),
    #[error("peer network unavailable")]
    NetworkUnavailable,
    #[error("room error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling endpoint lookup failed: {0}")]
    Lookup(String),
    #[error("malformed signaling endpoint response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("malformed configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level error for session operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The session controller task is no longer running.
    #[error("session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
