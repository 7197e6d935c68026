//! Device geometry
//!
//! The pipeline only needs the ordered list of device identifiers: payload
//! blocks are written into each frame in exactly this order.

use std::collections::HashSet;

use crate::error::ConfigError;

/// Identifier of one transducer device in the chain
pub type DeviceId = usize;

/// Ordered set of devices driven by one controller
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Geometry {
    device_ids: Vec<DeviceId>,
}

impl Geometry {
    /// Create a geometry from device ids in transmission order
    pub fn new(ids: impl IntoIterator<Item = DeviceId>) -> Result<Self, ConfigError> {
        let device_ids: Vec<DeviceId> = ids.into_iter().collect();
        let mut seen = HashSet::with_capacity(device_ids.len());
        for &id in &device_ids {
            if !seen.insert(id) {
                return Err(ConfigError::DuplicateDevice(id));
            }
        }
        Ok(Self { device_ids })
    }

    /// Geometry of `n` devices with ids `0..n`
    pub fn with_devices(n: usize) -> Self {
        Self {
            device_ids: (0..n).collect(),
        }
    }

    pub fn num_devices(&self) -> usize {
        self.device_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.device_ids.is_empty()
    }

    /// Device id at position `index` in transmission order
    pub fn device_id(&self, index: usize) -> Option<DeviceId> {
        self.device_ids.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.device_ids.iter().copied()
    }
}
