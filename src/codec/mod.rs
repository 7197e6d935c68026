//! Wire frame codec
//!
//! Frame assembly ("make body") on the sending side and frame validation
//! plus modulation reassembly on the receiving side.

pub mod decoder;
pub mod encoder;
pub mod frame;

pub use decoder::{FrameDecoder, ModulationAssembler};
pub use encoder::FrameEncoder;
pub use frame::{ControlFlags, Frame, FrameLayout};
