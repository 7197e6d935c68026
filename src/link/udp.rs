//! UDP link
//!
//! Sends every frame as one datagram to a fixed target. Used as the local
//! loopback transport against the `receiver` binary.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::codec::Frame;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::LinkError;
use crate::geometry::Geometry;
use crate::link::{Link, LinkBuilder};

/// Create a UDP socket bound to `bind`, with optional buffer sizes
pub fn create_socket(
    bind: SocketAddr,
    send_buffer_size: Option<usize>,
    recv_buffer_size: Option<usize>,
) -> Result<UdpSocket, LinkError> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(size) = send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

/// Builder for [`UdpLink`]
#[derive(Debug, Clone)]
pub struct UdpLinkBuilder {
    target: String,
    bind: Option<SocketAddr>,
    send_buffer_size: Option<usize>,
}

impl UdpLinkBuilder {
    /// `target` is a `host:port` address
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            bind: None,
            send_buffer_size: None,
        }
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = Some(bind);
        self
    }

    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    fn resolve(&self) -> Result<SocketAddr, LinkError> {
        self.target
            .to_socket_addrs()
            .map_err(|e| LinkError::InvalidAddress(format!("{}: {}", self.target, e)))?
            .next()
            .ok_or_else(|| LinkError::InvalidAddress(self.target.clone()))
    }
}

impl LinkBuilder for UdpLinkBuilder {
    type L = UdpLink;

    fn open(self, geometry: &Geometry) -> Result<UdpLink, LinkError> {
        let target = self.resolve()?;
        let bind = self.bind.unwrap_or_else(|| match target {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        });

        let socket = create_socket(bind, self.send_buffer_size, None)?;
        socket.connect(target)?;
        info!(
            %target,
            local = ?socket.local_addr().ok(),
            devices = geometry.num_devices(),
            "UDP link opened"
        );

        Ok(UdpLink {
            socket: Some(socket),
            target,
        })
    }
}

/// Link that sends frames as UDP datagrams
pub struct UdpLink {
    socket: Option<UdpSocket>,
    target: SocketAddr,
}

impl UdpLink {
    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl Link for UdpLink {
    fn close(&mut self) -> Result<(), LinkError> {
        if self.socket.take().is_some() {
            debug!(target = %self.target, "UDP link closed");
        }
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> Result<bool, LinkError> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(false);
        };
        if frame.len() > MAX_DATAGRAM_SIZE {
            return Err(LinkError::FrameTooLarge(frame.len()));
        }
        let written = socket.send(frame.as_bytes())?;
        if written != frame.len() {
            return Err(LinkError::ShortWrite {
                written,
                expected: frame.len(),
            });
        }
        Ok(true)
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}
