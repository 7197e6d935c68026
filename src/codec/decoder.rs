//! Frame decoder for the receiving peer
//!
//! Validates incoming frames and reassembles modulation drain passes from
//! the chunks spread across consecutive frames.

use bytes::Bytes;

use crate::codec::frame::{ControlFlags, Frame, FrameLayout};
use crate::error::FrameError;

/// Frame decoder with receive statistics
pub struct FrameDecoder {
    layout: FrameLayout,
    /// Frames decoded successfully
    frames_decoded: u64,
    /// Frames rejected as malformed
    frames_rejected: u64,
    /// Message id of the last good frame
    last_msg_id: Option<u8>,
}

impl FrameDecoder {
    pub fn new(layout: FrameLayout) -> Self {
        Self {
            layout,
            frames_decoded: 0,
            frames_rejected: 0,
            last_msg_id: None,
        }
    }

    /// Decode one received datagram
    pub fn decode(&mut self, data: &[u8]) -> Result<Frame, FrameError> {
        match Frame::parse(Bytes::copy_from_slice(data), self.layout) {
            Ok(frame) => {
                self.frames_decoded += 1;
                self.last_msg_id = Some(frame.msg_id());
                Ok(frame)
            }
            Err(e) => {
                self.frames_rejected += 1;
                Err(e)
            }
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_rejected: self.frames_rejected,
            last_msg_id: self.last_msg_id,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_rejected: u64,
    pub last_msg_id: Option<u8>,
}

/// Rebuilds complete modulation buffers from frame chunks
#[derive(Debug, Default)]
pub struct ModulationAssembler {
    current: Option<Vec<u8>>,
    /// Passes abandoned because a new LOOP_BEGIN arrived first
    broken_passes: u64,
}

impl ModulationAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next frame; returns a buffer when its last chunk arrives
    pub fn feed(&mut self, frame: &Frame) -> Option<Vec<u8>> {
        let flags = frame.control_flags();
        let begin = flags.contains(ControlFlags::LOOP_BEGIN);
        let end = flags.contains(ControlFlags::LOOP_END);

        if begin {
            if self.current.is_some() {
                self.broken_passes += 1;
            }
            self.current = Some(Vec::new());
        } else if frame.mod_size() == 0 && !end {
            return None;
        }

        let buffer = self.current.as_mut()?;
        buffer.extend_from_slice(frame.mod_chunk());
        if end {
            self.current.take()
        } else {
            None
        }
    }

    pub fn broken_passes(&self) -> u64 {
        self.broken_passes
    }
}
