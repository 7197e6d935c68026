//! Error types for the streaming pipeline

use thiserror::Error;

use crate::geometry::DeviceId;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Controller is not open")]
    NotOpen,

    #[error("Link reported closed right after opening")]
    LinkNotOpen,

    #[error("{queue} queue is full ({capacity} entries)")]
    QueueFull {
        queue: &'static str,
        capacity: usize,
    },

    #[error("Geometry cannot be replaced while the controller is open")]
    GeometryLocked,

    #[error("Failed to spawn pipeline stage: {0}")]
    Spawn(std::io::Error),
}

impl Error {
    /// Numeric device status carried by a link failure, if any
    pub fn status(&self) -> Option<u32> {
        match self {
            Error::Link(e) => e.status(),
            _ => None,
        }
    }
}

/// Link (transport) errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Invalid link address: {0}")]
    InvalidAddress(String),

    #[error("Link is not open")]
    NotOpen,

    #[error("Device reported status {0:#x}")]
    Status(u32),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Frame too large for link: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Numeric status reported by the device side, if the link has one
    pub fn status(&self) -> Option<u32> {
        match self {
            LinkError::Status(status) => Some(*status),
            LinkError::Io(e) => e.raw_os_error().map(|code| code as u32),
            _ => None,
        }
    }
}

/// Frame assembly and parsing errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Gain was not built before encoding")]
    GainNotBuilt,

    #[error("Gain has no payload for device {0}")]
    MissingPayload(DeviceId),

    #[error("Payload for device {device} is {actual} bytes, expected {expected}")]
    PayloadSize {
        device: DeviceId,
        expected: usize,
        actual: usize,
    },

    #[error("Frame truncated: {actual} bytes, header needs {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("Modulation size {size} exceeds chunk capacity {capacity}")]
    ModSizeOverflow { size: usize, capacity: usize },

    #[error("Payload of {0} bytes is not a whole number of device blocks")]
    PayloadMisaligned(usize),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid frame layout: {0}")]
    InvalidLayout(String),

    #[error("Invalid queue policy: {0}")]
    InvalidQueuePolicy(String),

    #[error("Duplicate device id: {0}")]
    DuplicateDevice(DeviceId),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
