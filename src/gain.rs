//! Gains: per-device drive payloads
//!
//! A gain is realized lazily by the build stage. The pipeline treats the
//! realized payload as opaque bytes, one fixed-size block per device.

use std::collections::HashMap;
use std::sync::Arc;

use crate::geometry::{DeviceId, Geometry};

/// Source of one per-device payload snapshot
pub trait Gain: Send {
    /// Realize the payload for every device in `geometry`.
    ///
    /// Called at most once per submission; `block_size` is the byte length
    /// every payload block must have.
    fn build(&mut self, geometry: &Geometry, block_size: usize);

    fn is_built(&self) -> bool;

    /// Payload block for `device`, available once built
    fn payload(&self, device: DeviceId) -> Option<&[u8]>;
}

/// A gain bound to the geometry it was submitted against
pub struct BoundGain {
    gain: Box<dyn Gain>,
    geometry: Arc<Geometry>,
    block_size: usize,
}

impl BoundGain {
    pub fn new(gain: Box<dyn Gain>, geometry: Arc<Geometry>, block_size: usize) -> Self {
        Self {
            gain,
            geometry,
            block_size,
        }
    }

    /// Build the gain unless it already is; repeated calls are no-ops
    pub fn build(&mut self) {
        if !self.gain.is_built() {
            self.gain.build(&self.geometry, self.block_size);
        }
    }

    pub fn is_built(&self) -> bool {
        self.gain.is_built()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn payload(&self, device: DeviceId) -> Option<&[u8]> {
        self.gain.payload(device)
    }
}

impl std::fmt::Debug for BoundGain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundGain")
            .field("built", &self.is_built())
            .field("devices", &self.geometry.num_devices())
            .finish()
    }
}

/// Gain that drives every transducer with zero
#[derive(Debug, Clone, Default)]
pub struct NullGain {
    zeros: Option<Vec<u8>>,
}

impl NullGain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Gain for NullGain {
    fn build(&mut self, _geometry: &Geometry, block_size: usize) {
        self.zeros = Some(vec![0; block_size]);
    }

    fn is_built(&self) -> bool {
        self.zeros.is_some()
    }

    fn payload(&self, _device: DeviceId) -> Option<&[u8]> {
        self.zeros.as_deref()
    }
}

/// Gain made of caller-supplied payload blocks
///
/// Devices without a block are driven with zeros once built.
#[derive(Debug, Clone, Default)]
pub struct RawGain {
    blocks: HashMap<DeviceId, Vec<u8>>,
    built: bool,
}

impl RawGain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the payload block for `device`
    pub fn with_block(mut self, device: DeviceId, block: impl Into<Vec<u8>>) -> Self {
        self.blocks.insert(device, block.into());
        self
    }
}

impl Gain for RawGain {
    fn build(&mut self, geometry: &Geometry, block_size: usize) {
        for device in geometry.iter() {
            self.blocks
                .entry(device)
                .or_insert_with(|| vec![0; block_size]);
        }
        self.built = true;
    }

    fn is_built(&self) -> bool {
        self.built
    }

    fn payload(&self, device: DeviceId) -> Option<&[u8]> {
        if !self.built {
            return None;
        }
        self.blocks.get(&device).map(Vec::as_slice)
    }
}
