//! Wire frame definition
//!
//! ```text
//! offset 0   msg_id          u8
//! offset 1   control_flags   u8
//! offset 2   reserved        u8 (always 0)
//! offset 3   mod_size        u8
//! offset 4   mod chunk       [u8; mod_chunk_capacity]
//! header end device blocks   [u8; device_block_size] x num_devices
//! ```

use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::constants::{DEVICE_BLOCK_SIZE, HEADER_FIXED_SIZE, MOD_FRAME_SIZE};
use crate::error::{ConfigError, FrameError};

pub(crate) const MSG_ID_OFFSET: usize = 0;
pub(crate) const CONTROL_FLAGS_OFFSET: usize = 1;
pub(crate) const MOD_SIZE_OFFSET: usize = 3;

/// Control flag bitset of the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ControlFlags(u8);

impl ControlFlags {
    pub const NONE: Self = Self(0);
    /// First chunk of a modulation drain pass
    pub const LOOP_BEGIN: Self = Self(1 << 0);
    /// Last chunk of a modulation drain pass
    pub const LOOP_END: Self = Self(1 << 1);
    /// Quiet drive mode
    pub const SILENT: Self = Self(1 << 3);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for ControlFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ControlFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Sizes of the variable parts of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLayout {
    /// Capacity of the inline modulation chunk area
    pub mod_chunk_capacity: usize,
    /// Payload bytes per device
    pub device_block_size: usize,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            mod_chunk_capacity: MOD_FRAME_SIZE,
            device_block_size: DEVICE_BLOCK_SIZE,
        }
    }
}

impl FrameLayout {
    pub fn new(mod_chunk_capacity: usize, device_block_size: usize) -> Self {
        Self {
            mod_chunk_capacity,
            device_block_size,
        }
    }

    pub fn header_size(&self) -> usize {
        HEADER_FIXED_SIZE + self.mod_chunk_capacity
    }

    /// Total frame size with a payload for `num_devices` devices
    pub fn frame_size(&self, num_devices: usize) -> usize {
        self.header_size() + self.device_block_size * num_devices
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mod_chunk_capacity == 0 || self.mod_chunk_capacity > u8::MAX as usize {
            return Err(ConfigError::InvalidLayout(format!(
                "mod_chunk_capacity must be in 1..=255, got {}",
                self.mod_chunk_capacity
            )));
        }
        if self.device_block_size == 0 {
            return Err(ConfigError::InvalidLayout(
                "device_block_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One assembled frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
    layout: FrameLayout,
}

impl Frame {
    /// Wrap raw bytes, checking them against `layout`
    pub fn parse(bytes: Bytes, layout: FrameLayout) -> Result<Self, FrameError> {
        let header_size = layout.header_size();
        if bytes.len() < header_size {
            return Err(FrameError::Truncated {
                expected: header_size,
                actual: bytes.len(),
            });
        }
        let mod_size = bytes[MOD_SIZE_OFFSET] as usize;
        if mod_size > layout.mod_chunk_capacity {
            return Err(FrameError::ModSizeOverflow {
                size: mod_size,
                capacity: layout.mod_chunk_capacity,
            });
        }
        let payload_len = bytes.len() - header_size;
        if payload_len % layout.device_block_size != 0 {
            return Err(FrameError::PayloadMisaligned(payload_len));
        }
        Ok(Self { bytes, layout })
    }

    pub(crate) fn from_parts(bytes: Bytes, layout: FrameLayout) -> Self {
        Self { bytes, layout }
    }

    pub fn msg_id(&self) -> u8 {
        self.bytes[MSG_ID_OFFSET]
    }

    pub fn control_flags(&self) -> ControlFlags {
        ControlFlags::from_bits(self.bytes[CONTROL_FLAGS_OFFSET])
    }

    pub fn mod_size(&self) -> usize {
        self.bytes[MOD_SIZE_OFFSET] as usize
    }

    /// Valid bytes of the inline modulation chunk
    pub fn mod_chunk(&self) -> &[u8] {
        &self.bytes[HEADER_FIXED_SIZE..HEADER_FIXED_SIZE + self.mod_size()]
    }

    /// Device payload following the header, empty for header-only frames
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.layout.header_size()..]
    }

    pub fn num_device_blocks(&self) -> usize {
        self.payload().len() / self.layout.device_block_size
    }

    /// Payload block at position `index` in geometry order
    pub fn device_block(&self, index: usize) -> Option<&[u8]> {
        let size = self.layout.device_block_size;
        self.payload().get(index * size..(index + 1) * size)
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}
