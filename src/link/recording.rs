//! In-process recording link
//!
//! Hands every transmitted frame to a channel instead of hardware. Supports
//! failure injection so pipeline teardown can be exercised.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::codec::Frame;
use crate::error::LinkError;
use crate::geometry::Geometry;
use crate::link::{Link, LinkBuilder};

/// Status reported for injected failures (ADS "invalid size")
pub const INJECTED_FAILURE_STATUS: u32 = 0x705;

/// Builder for [`RecordingLink`]
#[derive(Debug, Clone)]
pub struct RecordingLinkBuilder {
    frames_tx: Sender<Frame>,
    fail_on: Option<usize>,
    close_after: Option<usize>,
    send_delay: Option<Duration>,
    refuse: bool,
    start_closed: bool,
}

impl RecordingLinkBuilder {
    /// Create a builder and the receiving end of its frame channel
    pub fn new() -> (Self, Receiver<Frame>) {
        let (frames_tx, frames_rx) = unbounded();
        (
            Self {
                frames_tx,
                fail_on: None,
                close_after: None,
                send_delay: None,
                refuse: false,
                start_closed: false,
            },
            frames_rx,
        )
    }

    /// Fail the `n`th send (1-based) with [`INJECTED_FAILURE_STATUS`]
    pub fn fail_on(mut self, n: usize) -> Self {
        self.fail_on = Some(n);
        self
    }

    /// Report the link as closed after the `n`th successful send, without
    /// returning an error
    pub fn close_after(mut self, n: usize) -> Self {
        self.close_after = Some(n);
        self
    }

    /// Sleep this long inside every send
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    /// Make `open` fail as if the address were malformed
    pub fn refuse_open(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Open successfully but report the link as closed
    pub fn start_closed(mut self) -> Self {
        self.start_closed = true;
        self
    }
}

impl LinkBuilder for RecordingLinkBuilder {
    type L = RecordingLink;

    fn open(self, geometry: &Geometry) -> Result<RecordingLink, LinkError> {
        if self.refuse {
            return Err(LinkError::InvalidAddress("recording link refused".to_string()));
        }
        debug!(devices = geometry.num_devices(), "recording link opened");
        Ok(RecordingLink {
            frames_tx: self.frames_tx,
            fail_on: self.fail_on,
            close_after: self.close_after,
            send_delay: self.send_delay,
            attempts: 0,
            open: !self.start_closed,
        })
    }
}

/// Link that records frames on a channel
pub struct RecordingLink {
    frames_tx: Sender<Frame>,
    fail_on: Option<usize>,
    close_after: Option<usize>,
    send_delay: Option<Duration>,
    attempts: usize,
    open: bool,
}

impl Link for RecordingLink {
    fn close(&mut self) -> Result<(), LinkError> {
        self.open = false;
        Ok(())
    }

    fn send(&mut self, frame: &Frame) -> Result<bool, LinkError> {
        if !self.open {
            return Ok(false);
        }
        self.attempts += 1;
        if let Some(delay) = self.send_delay {
            thread::sleep(delay);
        }
        if self.fail_on == Some(self.attempts) {
            return Err(LinkError::Status(INJECTED_FAILURE_STATUS));
        }
        // the receiving side may have gone away; the frame still counts as sent
        let _ = self.frames_tx.send(frame.clone());
        if self.close_after == Some(self.attempts) {
            self.open = false;
        }
        Ok(true)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
