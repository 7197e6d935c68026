//! Configuration
//!
//! Controller settings and the binaries' settings, loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::FrameLayout;
use crate::constants::DEFAULT_UDP_PORT;
use crate::error::ConfigError;
use crate::pipeline::QueuePolicy;

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Initial state of the SILENT control flag
    pub silent_mode: bool,
    pub layout: FrameLayout,
    pub queue: QueuePolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            silent_mode: true,
            layout: FrameLayout::default(),
            queue: QueuePolicy::Unbounded,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout.validate()?;
        self.queue.validate()
    }
}

/// UDP link settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UdpConfig {
    /// `host:port` of the receiving peer
    pub target: String,
    /// Address the receiver binds to
    pub bind: String,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            target: format!("127.0.0.1:{}", DEFAULT_UDP_PORT),
            bind: format!("0.0.0.0:{}", DEFAULT_UDP_PORT),
            send_buffer_size: None,
            recv_buffer_size: Some(1 << 20),
        }
    }
}

/// Settings of the sender/receiver binaries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Number of devices in the chain
    pub devices: usize,
    pub controller: ControllerConfig,
    pub udp: UdpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            controller: ControllerConfig::default(),
            udp: UdpConfig::default(),
        }
    }
}

impl AppConfig {
    /// Default config file location for this user
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("jp", "hapis", "autd-stream")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Load from `path`, or the default location, falling back to defaults
    /// when no file exists
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if path.exists() {
            Self::load(&path)
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()
    }
}
