//! # AUTD Stream
//!
//! Low-latency gain/modulation streaming to chains of ultrasound
//! transducer array devices.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             Controller                               │
//! │                                                                      │
//! │  append_gain ──► ┌─────────────┐   ┌─────────────┐                   │
//! │                  │ Build Queue │──►│ Build Stage │──┐                │
//! │                  └─────────────┘   │  (thread)   │  │                │
//! │                                    └─────────────┘  ▼                │
//! │                                            ┌─────────────────┐       │
//! │                                            │ Send Gain Queue │──┐    │
//! │                                            └─────────────────┘  │    │
//! │  append_modulation ──────────────────────► ┌─────────────────┐  │    │
//! │                                            │ Send Mod Queue  │──┤    │
//! │                                            └─────────────────┘  ▼    │
//! │                                                    ┌──────────────┐  │
//! │  append_*_sync ───────────────────────────────────►│ FrameEncoder │  │
//! │                                                    └──────┬───────┘  │
//! │                                                           ▼          │
//! │                                                 ┌──────────────────┐ │
//! │                                                 │ Send Stage/Link  │ │
//! │                                                 └────────┬─────────┘ │
//! └──────────────────────────────────────────────────────────┼───────────┘
//!                                                            │ Frames:
//!                                                            │ [MsgId|Flags|0|ModSize|ModChunk|Blocks...]
//!                                                            ▼
//!                                               Device chain (UDP / recording)
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod gain;
pub mod geometry;
pub mod link;
pub mod modulation;
pub mod pipeline;

pub use codec::{ControlFlags, Frame, FrameDecoder, FrameEncoder, FrameLayout};
pub use config::{AppConfig, ControllerConfig};
pub use error::{Error, Result};
pub use gain::{Gain, NullGain, RawGain};
pub use geometry::{DeviceId, Geometry};
pub use link::{Link, LinkBuilder};
pub use modulation::Modulation;
pub use pipeline::{Controller, ControllerStats, OverflowPolicy, QueuePolicy};

/// Application-wide constants
pub mod constants {
    /// Transducers driven by one device
    pub const NUM_TRANS_IN_UNIT: usize = 249;

    /// Default per-device payload: one 16-bit drive word per transducer
    pub const DEVICE_BLOCK_SIZE: usize = NUM_TRANS_IN_UNIT * 2;

    /// Default modulation chunk capacity of a frame header
    pub const MOD_FRAME_SIZE: usize = 124;

    /// msg_id, control_flags, reserved, mod_size
    pub const HEADER_FIXED_SIZE: usize = 4;

    /// Default UDP port for frame streaming
    pub const DEFAULT_UDP_PORT: u16 = 50632;

    /// Largest UDP payload over IPv4
    pub const MAX_DATAGRAM_SIZE: usize = 65_507;
}
