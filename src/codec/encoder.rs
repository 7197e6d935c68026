//! Frame encoder
//!
//! Assembles one wire frame from at most one gain and one modulation chunk.
//! Shared between the send stage and the synchronous submission path, so all
//! mutable state is atomic.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use bytes::{BufMut, BytesMut};

use crate::codec::frame::{
    ControlFlags, Frame, FrameLayout, CONTROL_FLAGS_OFFSET, MOD_SIZE_OFFSET, MSG_ID_OFFSET,
};
use crate::constants::HEADER_FIXED_SIZE;
use crate::error::FrameError;
use crate::gain::BoundGain;
use crate::modulation::Modulation;

/// Frame encoder with session-wide header state
pub struct FrameEncoder {
    layout: FrameLayout,
    silent: AtomicBool,
    next_msg_id: AtomicU8,
    /// Frame counter for statistics
    frames_encoded: AtomicU64,
    /// Total bytes produced
    bytes_produced: AtomicU64,
}

impl FrameEncoder {
    pub fn new(layout: FrameLayout, silent: bool) -> Self {
        Self {
            layout,
            silent: AtomicBool::new(silent),
            next_msg_id: AtomicU8::new(1),
            frames_encoded: AtomicU64::new(0),
            bytes_produced: AtomicU64::new(0),
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    pub fn is_silent(&self) -> bool {
        self.silent.load(Ordering::Relaxed)
    }

    /// Assemble one frame.
    ///
    /// The gain, if any, must already be built. The modulation cursor only
    /// advances when encoding succeeds.
    pub fn encode(
        &self,
        gain: Option<&BoundGain>,
        modulation: Option<&mut Modulation>,
    ) -> Result<Frame, FrameError> {
        let header_size = self.layout.header_size();
        let num_devices = gain.map_or(0, |g| g.geometry().num_devices());

        let mut body = BytesMut::with_capacity(self.layout.frame_size(num_devices));
        body.put_bytes(0, header_size);

        if let Some(gain) = gain {
            if !gain.is_built() {
                return Err(FrameError::GainNotBuilt);
            }
            for device in gain.geometry().iter() {
                let block = gain
                    .payload(device)
                    .ok_or(FrameError::MissingPayload(device))?;
                if block.len() != self.layout.device_block_size {
                    return Err(FrameError::PayloadSize {
                        device,
                        expected: self.layout.device_block_size,
                        actual: block.len(),
                    });
                }
                body.put_slice(block);
            }
        }

        let mut flags = ControlFlags::NONE;
        if self.is_silent() {
            flags |= ControlFlags::SILENT;
        }

        if let Some(modulation) = modulation {
            let chunk = modulation.next_chunk(self.layout.mod_chunk_capacity);
            flags.set(ControlFlags::LOOP_BEGIN, chunk.loop_begin);
            flags.set(ControlFlags::LOOP_END, chunk.loop_end);
            body[MOD_SIZE_OFFSET] = chunk.data.len() as u8;
            body[HEADER_FIXED_SIZE..HEADER_FIXED_SIZE + chunk.data.len()]
                .copy_from_slice(chunk.data);
        }

        body[MSG_ID_OFFSET] = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        body[CONTROL_FLAGS_OFFSET] = flags.bits();

        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.bytes_produced
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        Ok(Frame::from_parts(body.freeze(), self.layout))
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        let frames_encoded = self.frames_encoded.load(Ordering::Relaxed);
        let bytes_produced = self.bytes_produced.load(Ordering::Relaxed);
        EncoderStats {
            frames_encoded,
            bytes_produced,
            average_frame_size: if frames_encoded > 0 {
                bytes_produced as f32 / frames_encoded as f32
            } else {
                0.0
            },
        }
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.frames_encoded.store(0, Ordering::Relaxed);
        self.bytes_produced.store(0, Ordering::Relaxed);
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
