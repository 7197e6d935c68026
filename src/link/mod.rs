//! Link layer: the transport that carries frames to the devices

pub mod recording;
pub mod udp;

pub use recording::{RecordingLink, RecordingLinkBuilder};
pub use udp::{create_socket, UdpLink, UdpLinkBuilder};

use crate::codec::Frame;
use crate::error::LinkError;
use crate::geometry::Geometry;

/// An open connection to the device chain
pub trait Link: Send {
    /// Release the connection
    fn close(&mut self) -> Result<(), LinkError>;

    /// Transmit one complete frame.
    ///
    /// Returns `Ok(false)` when nothing was sent because the link is closed.
    fn send(&mut self, frame: &Frame) -> Result<bool, LinkError>;

    fn is_open(&self) -> bool;
}

/// Configuration of a link not yet opened
pub trait LinkBuilder {
    type L: Link + 'static;

    /// Establish the connection for the devices in `geometry`
    fn open(self, geometry: &Geometry) -> Result<Self::L, LinkError>;
}
