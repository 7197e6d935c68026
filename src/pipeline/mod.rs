//! Streaming pipeline
//!
//! ```text
//!  append_gain ──► build queue ──► [build stage] ──► send-gain queue ──┐
//!                                                                      ├─► [send stage] ──► Link
//!  append_modulation ─────────────────────────────► send-mod queue ────┘
//!
//!  append_gain_sync / append_modulation_sync ──► encoder ──► Link   (caller thread)
//! ```
//!
//! Each stage runs on its own thread for the lifetime of one open link.
//! Queue locks are never held while a frame is transmitted.

mod build;
pub mod queue;
mod send;

pub use queue::{OverflowPolicy, QueuePolicy};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::codec::encoder::EncoderStats;
use crate::codec::{Frame, FrameEncoder};
use crate::config::ControllerConfig;
use crate::error::{Error, LinkError, Result};
use crate::gain::{BoundGain, Gain, NullGain};
use crate::geometry::Geometry;
use crate::link::{Link, LinkBuilder};
use crate::modulation::Modulation;
use queue::{PendingQueue, Push};

/// Queues consumed by the send stage, guarded by one lock
pub(crate) struct SendQueues {
    pub(crate) gains: PendingQueue<BoundGain>,
    pub(crate) mods: PendingQueue<Modulation>,
}

impl SendQueues {
    fn is_empty(&self) -> bool {
        self.gains.is_empty() && self.mods.is_empty()
    }
}

/// State shared between the controller and both stages
pub(crate) struct Shared {
    link: Mutex<Option<Box<dyn Link>>>,
    /// Session token; stages exit once it is cleared
    running: AtomicBool,
    pub(crate) build: Mutex<PendingQueue<BoundGain>>,
    pub(crate) build_cond: Condvar,
    pub(crate) send: Mutex<SendQueues>,
    pub(crate) send_cond: Condvar,
    /// Bumped by every flush while both queue locks are held
    epoch: AtomicU64,
    pub(crate) encoder: FrameEncoder,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    dropped_entries: AtomicU64,
}

impl Shared {
    fn new(config: &ControllerConfig) -> Self {
        Self {
            link: Mutex::new(None),
            running: AtomicBool::new(false),
            build: Mutex::new(PendingQueue::new(config.queue)),
            build_cond: Condvar::new(),
            send: Mutex::new(SendQueues {
                gains: PendingQueue::new(config.queue),
                mods: PendingQueue::new(config.queue),
            }),
            send_cond: Condvar::new(),
            epoch: AtomicU64::new(0),
            encoder: FrameEncoder::new(config.layout, config.silent_mode),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            dropped_entries: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flush epoch; read it under either queue lock
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn note_dropped(&self) {
        self.dropped_entries.fetch_add(1, Ordering::Relaxed);
    }

    fn link_is_open(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|link| link.is_open())
    }

    /// Session running and the link still reports open
    pub(crate) fn is_open(&self) -> bool {
        self.is_running() && self.link_is_open()
    }

    /// Stop a session whose link closed on its own
    pub(crate) fn end_if_link_closed(&self) {
        if self.is_running() && !self.link_is_open() {
            self.fail_session(Error::Link(LinkError::NotOpen));
        }
    }

    /// Send one frame if a link is installed and open
    pub(crate) fn transmit(&self, frame: &Frame) -> std::result::Result<bool, LinkError> {
        let mut link = self.link.lock();
        let sent = match link.as_mut() {
            Some(link) if link.is_open() => link.send(frame)?,
            _ => false,
        };
        if sent {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
            self.bytes_sent
                .fetch_add(frame.len() as u64, Ordering::Relaxed);
        }
        Ok(sent)
    }

    fn close_link(&self) -> std::result::Result<(), LinkError> {
        match self.link.lock().as_mut() {
            Some(link) if link.is_open() => link.close(),
            _ => Ok(()),
        }
    }

    /// Empty all queues and wake both stages
    pub(crate) fn flush(&self) {
        let mut send = self.send.lock();
        let mut build = self.build.lock();
        build.clear();
        send.gains.clear();
        send.mods.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.build_cond.notify_all();
        self.send_cond.notify_all();
    }

    /// Called by a stage when the session cannot continue
    pub(crate) fn fail_session(&self, err: Error) {
        error!(error = %err, status = ?err.status(), "link failure, closing controller");
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.close_link() {
            warn!(error = %e, "failed to close link after failure");
        }
        self.flush();
    }
}

struct Workers {
    build: JoinHandle<()>,
    send: JoinHandle<()>,
}

impl Workers {
    fn spawn(shared: &Arc<Shared>) -> std::io::Result<Self> {
        let build = build::spawn(Arc::clone(shared))?;
        let send = match send::spawn(Arc::clone(shared)) {
            Ok(send) => send,
            Err(e) => {
                shared.running.store(false, Ordering::SeqCst);
                shared.flush();
                let _ = build.join();
                return Err(e);
            }
        };
        Ok(Self { build, send })
    }

    fn join(self) {
        for (name, handle) in [("build", self.build), ("send", self.send)] {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                error!(stage = name, "pipeline stage panicked");
            }
        }
    }
}

/// Pipeline statistics
#[derive(Debug, Clone, Default)]
pub struct ControllerStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Entries discarded by a bounded queue policy
    pub dropped_entries: u64,
    pub remaining_work: usize,
    pub encoder: EncoderStats,
}

/// Streams gains and modulations to a device chain over one link
pub struct Controller {
    geometry: RwLock<Arc<Geometry>>,
    config: ControllerConfig,
    shared: Arc<Shared>,
    /// Also serializes open/close
    workers: Mutex<Option<Workers>>,
}

impl Controller {
    pub fn new(geometry: Geometry, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            geometry: RwLock::new(Arc::new(geometry)),
            shared: Arc::new(Shared::new(&config)),
            config,
            workers: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn geometry(&self) -> Arc<Geometry> {
        Arc::clone(&self.geometry.read())
    }

    /// Replace the geometry; only allowed while closed
    pub fn set_geometry(&self, geometry: Geometry) -> Result<()> {
        let _session = self.workers.lock();
        if self.is_open() {
            return Err(Error::GeometryLocked);
        }
        *self.geometry.write() = Arc::new(geometry);
        Ok(())
    }

    /// Close any running session, open a new link and start both stages
    pub fn open<B: LinkBuilder>(&self, builder: B) -> Result<()> {
        let mut workers = self.workers.lock();
        if let Err(e) = self.close_session(&mut workers) {
            warn!(error = %e, "error while closing previous session");
        }

        let geometry = self.geometry();
        let link = builder.open(&geometry)?;
        if !link.is_open() {
            warn!("link reported closed after open");
            return Err(Error::LinkNotOpen);
        }

        *self.shared.link.lock() = Some(Box::new(link));
        self.shared.running.store(true, Ordering::SeqCst);
        match Workers::spawn(&self.shared) {
            Ok(spawned) => *workers = Some(spawned),
            Err(e) => {
                let _ = self.teardown(&mut workers);
                return Err(Error::Spawn(e));
            }
        }

        info!(devices = geometry.num_devices(), "pipeline started");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Park the devices with a null gain, close the link and stop both stages
    pub fn close(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        self.close_session(&mut workers)
    }

    /// Queue a gain for the build stage
    pub fn append_gain<G: Gain + 'static>(&self, gain: G) -> Result<()> {
        if !self.shared.is_open() {
            return Err(Error::NotOpen);
        }
        let gain = self.bind(Box::new(gain));
        let (outcome, capacity) = {
            let mut queue = self.shared.build.lock();
            (queue.push(gain), queue.capacity())
        };
        match outcome {
            Push::Queued => {}
            Push::Displaced(_) => {
                self.shared.note_dropped();
                warn!("build queue full, dropped oldest gain");
            }
            Push::Rejected(_) => {
                return Err(Error::QueueFull {
                    queue: "build",
                    capacity: capacity.unwrap_or_default(),
                })
            }
        }
        self.shared.build_cond.notify_all();
        Ok(())
    }

    /// Build and send a gain on the calling thread, bypassing the queues
    pub fn append_gain_sync<G: Gain + 'static>(&self, gain: G) -> Result<()> {
        let result = self.send_gain_now(Box::new(gain));
        self.abort_on_failure(result)
    }

    /// Queue a modulation for the send stage
    pub fn append_modulation(&self, modulation: Modulation) -> Result<()> {
        if !self.shared.is_open() {
            return Err(Error::NotOpen);
        }
        let (outcome, capacity) = {
            let mut queues = self.shared.send.lock();
            (queues.mods.push(modulation), queues.mods.capacity())
        };
        match outcome {
            Push::Queued => {}
            Push::Displaced(_) => {
                self.shared.note_dropped();
                warn!("modulation queue full, dropped oldest modulation");
            }
            Push::Rejected(_) => {
                return Err(Error::QueueFull {
                    queue: "modulation",
                    capacity: capacity.unwrap_or_default(),
                })
            }
        }
        self.shared.send_cond.notify_all();
        Ok(())
    }

    /// Send the whole modulation on the calling thread, then rewind it
    pub fn append_modulation_sync(&self, modulation: &mut Modulation) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        let result = self.drain_now(modulation);
        modulation.rewind();
        self.abort_on_failure(result)
    }

    /// Drop everything still queued; frames in flight complete
    pub fn flush(&self) {
        self.shared.flush();
        debug!("pipeline queues flushed");
    }

    /// Entries waiting in the three queues
    pub fn remaining_work(&self) -> usize {
        let build = self.shared.build.lock().len();
        let send = {
            let queues = self.shared.send.lock();
            queues.gains.len() + queues.mods.len()
        };
        build + send
    }

    pub fn set_silent_mode(&self, silent: bool) {
        self.shared.encoder.set_silent(silent);
    }

    pub fn silent_mode(&self) -> bool {
        self.shared.encoder.is_silent()
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            dropped_entries: self.shared.dropped_entries.load(Ordering::Relaxed),
            remaining_work: self.remaining_work(),
            encoder: self.shared.encoder.stats(),
        }
    }

    fn bind(&self, gain: Box<dyn Gain>) -> BoundGain {
        BoundGain::new(
            gain,
            self.geometry(),
            self.config.layout.device_block_size,
        )
    }

    fn send_gain_now(&self, gain: Box<dyn Gain>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpen);
        }
        let mut gain = self.bind(gain);
        gain.build();
        let frame = self.shared.encoder.encode(Some(&gain), None)?;
        self.shared.transmit(&frame)?;
        Ok(())
    }

    fn drain_now(&self, modulation: &mut Modulation) -> Result<()> {
        while !modulation.is_drained() {
            let frame = self.shared.encoder.encode(None, Some(modulation))?;
            if !self.shared.transmit(&frame)? {
                return Err(Error::NotOpen);
            }
        }
        Ok(())
    }

    /// Tear the session down if a synchronous send failed
    fn abort_on_failure(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(Error::NotOpen) => Err(Error::NotOpen),
            Err(e) => {
                error!(error = %e, status = ?e.status(), "synchronous send failed, closing controller");
                let mut workers = self.workers.lock();
                if let Err(close_err) = self.teardown(&mut workers) {
                    warn!(error = %close_err, "failed to close link after failure");
                }
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    fn close_session(&self, workers: &mut Option<Workers>) -> Result<()> {
        let parked = if self.is_open() {
            self.send_gain_now(Box::new(NullGain::new()))
        } else {
            Ok(())
        };
        if let Err(e) = &parked {
            warn!(error = %e, "failed to send null gain before closing");
        }
        let closed = self.teardown(workers);
        parked?;
        closed.map_err(Error::from)
    }

    fn teardown(&self, workers: &mut Option<Workers>) -> std::result::Result<(), LinkError> {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        let closed = self.shared.close_link();
        self.shared.flush();
        if let Some(workers) = workers.take() {
            workers.join();
        }
        self.shared.link.lock().take();
        if was_running {
            info!("pipeline stopped");
        }
        closed
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error while closing controller");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ControlFlags, FrameLayout, ModulationAssembler};
    use crate::gain::RawGain;
    use crate::geometry::DeviceId;
    use crate::link::recording::{RecordingLinkBuilder, INJECTED_FAILURE_STATUS};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn controller(layout: FrameLayout, devices: usize) -> Controller {
        controller_with(layout, devices, QueuePolicy::Unbounded)
    }

    fn controller_with(layout: FrameLayout, devices: usize, queue: QueuePolicy) -> Controller {
        Controller::new(
            Geometry::with_devices(devices),
            ControllerConfig {
                silent_mode: false,
                layout,
                queue,
            },
        )
        .unwrap()
    }

    fn recv(frames: &Receiver<Frame>) -> Frame {
        frames.recv_timeout(TIMEOUT).expect("frame not received")
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    struct TaggedGain {
        tag: u8,
        builds: Arc<AtomicUsize>,
        block: Option<Vec<u8>>,
    }

    impl TaggedGain {
        fn new(tag: u8) -> (Self, Arc<AtomicUsize>) {
            let builds = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    tag,
                    builds: builds.clone(),
                    block: None,
                },
                builds,
            )
        }
    }

    impl Gain for TaggedGain {
        fn build(&mut self, _geometry: &Geometry, block_size: usize) {
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.block = Some(vec![self.tag; block_size]);
        }

        fn is_built(&self) -> bool {
            self.block.is_some()
        }

        fn payload(&self, _device: DeviceId) -> Option<&[u8]> {
            self.block.as_deref()
        }
    }

    /// Gain whose build blocks until released
    struct BlockingGain {
        release: Receiver<()>,
        block: Option<Vec<u8>>,
    }

    impl Gain for BlockingGain {
        fn build(&mut self, _geometry: &Geometry, block_size: usize) {
            let _ = self.release.recv_timeout(TIMEOUT);
            self.block = Some(vec![0; block_size]);
        }

        fn is_built(&self) -> bool {
            self.block.is_some()
        }

        fn payload(&self, _device: DeviceId) -> Option<&[u8]> {
            self.block.as_deref()
        }
    }

    /// Gain that closes its own controller while being built
    struct ClosingGain {
        controller: Arc<Controller>,
        done: Sender<(bool, bool)>,
        block: Option<Vec<u8>>,
    }

    impl Gain for ClosingGain {
        fn build(&mut self, _geometry: &Geometry, block_size: usize) {
            let closed = self.controller.close().is_ok();
            let _ = self.done.send((closed, self.controller.is_open()));
            self.block = Some(vec![0; block_size]);
        }

        fn is_built(&self) -> bool {
            self.block.is_some()
        }

        fn payload(&self, _device: DeviceId) -> Option<&[u8]> {
            self.block.as_deref()
        }
    }

    #[test]
    fn test_gains_sent_in_order_built_once() {
        let autd = controller(FrameLayout::new(4, 2), 3);
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();
        assert!(autd.is_open());

        let mut counters = Vec::new();
        for tag in 1..=20u8 {
            let (gain, builds) = TaggedGain::new(tag);
            counters.push(builds);
            autd.append_gain(gain).unwrap();
        }

        for tag in 1..=20u8 {
            let frame = recv(&frames);
            assert_eq!(frame.num_device_blocks(), 3);
            assert!(frame.payload().iter().all(|&b| b == tag));
            assert_eq!(frame.mod_size(), 0);
        }
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));

        autd.close().unwrap();
        let parked = recv(&frames);
        assert!(parked.payload().iter().all(|&b| b == 0));
        assert!(!autd.is_open());
        assert_eq!(autd.stats().frames_sent, 21);
    }

    #[test]
    fn test_modulation_streamed_in_chunks() {
        let autd = controller(FrameLayout::new(4, 2), 1);
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();

        let buffer: Vec<u8> = (0..10).collect();
        autd.append_modulation(Modulation::new(buffer.clone())).unwrap();

        let sent: Vec<Frame> = (0..3).map(|_| recv(&frames)).collect();
        assert_eq!(
            sent.iter().map(Frame::mod_size).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        let flags: Vec<ControlFlags> = sent.iter().map(Frame::control_flags).collect();
        assert_eq!(flags[0], ControlFlags::LOOP_BEGIN);
        assert_eq!(flags[1], ControlFlags::NONE);
        assert_eq!(flags[2], ControlFlags::LOOP_END);

        let mut assembler = ModulationAssembler::new();
        let passes: Vec<Vec<u8>> = sent.iter().filter_map(|f| assembler.feed(f)).collect();
        assert_eq!(passes, vec![buffer]);

        assert!(frames.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(autd.remaining_work(), 0);
    }

    #[test]
    fn test_gain_and_modulation_merge() {
        let autd = controller(FrameLayout::new(2, 4), 2);
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();

        autd.append_gain(
            RawGain::new()
                .with_block(0, vec![0xA0, 0xA1, 0xA2, 0xA3])
                .with_block(1, vec![0xB0, 0xB1, 0xB2, 0xB3]),
        )
        .unwrap();
        autd.append_modulation(Modulation::new(vec![1, 2, 3, 4, 5]))
            .unwrap();

        let mut assembler = ModulationAssembler::new();
        let mut passes = Vec::new();
        let mut payloads = Vec::new();
        let mut mod_frames = 0;
        while passes.is_empty() || payloads.is_empty() {
            let frame = recv(&frames);
            if frame.mod_size() > 0 {
                mod_frames += 1;
            }
            if !frame.payload().is_empty() {
                payloads.push(frame.payload().to_vec());
            }
            passes.extend(assembler.feed(&frame));
        }

        assert_eq!(passes, vec![vec![1, 2, 3, 4, 5]]);
        assert_eq!(mod_frames, 3);
        assert_eq!(
            payloads,
            vec![vec![0xA0, 0xA1, 0xA2, 0xA3, 0xB0, 0xB1, 0xB2, 0xB3]]
        );
    }

    #[test]
    fn test_flush_discards_queued_and_in_flight_work() {
        let autd = controller(FrameLayout::new(4, 2), 1);
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder.with_send_delay(Duration::from_millis(20)))
            .unwrap();

        // hold the build stage inside a build
        let (release_tx, release_rx) = bounded(1);
        autd.append_gain(BlockingGain {
            release: release_rx,
            block: None,
        })
        .unwrap();
        assert!(wait_until(|| autd.remaining_work() == 0));

        for tag in 1..=5 {
            autd.append_gain(TaggedGain::new(tag).0).unwrap();
        }
        autd.append_modulation(Modulation::new(vec![0xEE; 64])).unwrap();
        autd.append_modulation(Modulation::new(vec![0xDD; 64])).unwrap();

        let first = recv(&frames);
        assert_eq!(first.mod_chunk(), &[0xEE; 4]);

        autd.flush();
        assert_eq!(autd.remaining_work(), 0);
        assert!(autd.is_open());
        let sent_at_flush = autd.stats().frames_sent;

        release_tx.send(()).unwrap();
        autd.append_gain(TaggedGain::new(9).0).unwrap();

        let mut mod_frames = 1;
        loop {
            let frame = recv(&frames);
            if !frame.payload().is_empty() {
                assert!(frame.payload().iter().all(|&b| b == 9));
                assert_eq!(frame.mod_size(), 0);
                break;
            }
            assert!(frame.mod_chunk().iter().all(|&b| b == 0xEE));
            assert!(!frame.control_flags().contains(ControlFlags::LOOP_END));
            mod_frames += 1;
        }
        assert!(mod_frames <= sent_at_flush + 1);
        assert!(frames.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(autd.remaining_work(), 0);
    }

    #[test]
    fn test_link_closing_itself_stops_session() {
        let autd = controller(FrameLayout::new(4, 2), 1);
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder.close_after(1)).unwrap();

        autd.append_gain(TaggedGain::new(1).0).unwrap();
        assert!(recv(&frames).payload().iter().all(|&b| b == 1));
        assert!(wait_until(|| !autd.shared.is_running()));
        assert!(!autd.is_open());

        assert!(matches!(
            autd.append_gain(TaggedGain::new(2).0),
            Err(Error::NotOpen)
        ));
        assert!(matches!(
            autd.append_modulation(Modulation::new(vec![1, 2, 3, 4, 5])),
            Err(Error::NotOpen)
        ));
        assert_eq!(autd.remaining_work(), 0);
        assert_eq!(autd.stats().encoder.frames_encoded, 1);
        assert!(frames.try_recv().is_err());

        autd.close().unwrap();
    }

    #[test]
    fn test_close_from_build_stage() {
        let autd = Arc::new(controller(FrameLayout::new(4, 2), 1));
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();

        let (done_tx, done_rx) = bounded(1);
        autd.append_gain(ClosingGain {
            controller: Arc::clone(&autd),
            done: done_tx,
            block: None,
        })
        .unwrap();

        let (closed, still_open) = done_rx
            .recv_timeout(TIMEOUT)
            .expect("close from the build stage deadlocked");
        assert!(closed);
        assert!(!still_open);
        // null gain parked the devices
        assert!(recv(&frames).payload().iter().all(|&b| b == 0));
        assert!(autd.close().is_ok());
    }

    #[test]
    fn test_close_while_idle_terminates() {
        let autd = controller(FrameLayout::default(), 1);
        let (builder, _frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();
        thread::sleep(Duration::from_millis(20));

        let (done_tx, done_rx) = bounded(1);
        thread::spawn(move || {
            let result = autd.close();
            let _ = done_tx.send((result.is_ok(), autd.is_open()));
        });

        let (closed, still_open) = done_rx.recv_timeout(TIMEOUT).expect("close deadlocked");
        assert!(closed);
        assert!(!still_open);
    }

    #[test]
    fn test_transmit_failure_closes_controller() {
        let autd = controller(FrameLayout::new(4, 2), 1);
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder.fail_on(3)).unwrap();

        for tag in 0..6 {
            autd.append_gain(TaggedGain::new(tag).0).unwrap();
        }

        assert!(wait_until(|| !autd.is_open()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(frames.try_iter().count(), 2);
        assert_eq!(autd.remaining_work(), 0);

        assert!(matches!(
            autd.append_gain(TaggedGain::new(7).0),
            Err(Error::NotOpen)
        ));
        autd.close().unwrap();
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn test_sync_gain_bypasses_queues() {
        let autd = controller(FrameLayout::new(2, 4), 2);
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();

        let (gain, builds) = TaggedGain::new(0xFF);
        autd.append_gain_sync(gain).unwrap();

        let frame = frames.try_recv().expect("sent on the calling thread");
        assert_eq!(frame.payload(), &[0xFF; 8]);
        assert_eq!(frame.control_flags(), ControlFlags::NONE);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(autd.remaining_work(), 0);
    }

    #[test]
    fn test_sync_modulation_rewinds() {
        let autd = controller(FrameLayout::new(2, 4), 1);
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();

        let mut m = Modulation::new(vec![1, 2, 3, 4, 5]);
        autd.append_modulation_sync(&mut m).unwrap();
        assert_eq!(m.sent(), 0);

        let sent: Vec<Frame> = frames.try_iter().collect();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].control_flags().contains(ControlFlags::LOOP_BEGIN));
        assert!(sent[2].control_flags().contains(ControlFlags::LOOP_END));
        assert_eq!(sent[2].mod_chunk(), &[5]);
        assert!(sent.iter().all(|f| f.payload().is_empty()));
    }

    #[test]
    fn test_sync_failure_closes_and_propagates() {
        let autd = controller(FrameLayout::new(2, 4), 1);
        let (builder, _frames) = RecordingLinkBuilder::new();
        autd.open(builder.fail_on(1)).unwrap();

        let err = autd.append_gain_sync(TaggedGain::new(1).0).unwrap_err();
        assert_eq!(err.status(), Some(INJECTED_FAILURE_STATUS));
        assert!(!autd.is_open());
    }

    #[test]
    fn test_submission_rejected_when_closed() {
        let autd = controller(FrameLayout::default(), 1);
        assert!(!autd.is_open());
        assert!(matches!(autd.append_gain(NullGain::new()), Err(Error::NotOpen)));
        assert!(matches!(autd.append_gain_sync(NullGain::new()), Err(Error::NotOpen)));
        assert!(matches!(
            autd.append_modulation(Modulation::new(vec![1])),
            Err(Error::NotOpen)
        ));
        assert!(matches!(
            autd.append_modulation_sync(&mut Modulation::new(vec![1])),
            Err(Error::NotOpen)
        ));
        assert!(autd.close().is_ok());
    }

    #[test]
    fn test_open_failures_leave_controller_closed() {
        let autd = controller(FrameLayout::default(), 1);

        let (builder, _frames) = RecordingLinkBuilder::new();
        let err = autd.open(builder.refuse_open()).unwrap_err();
        assert!(matches!(err, Error::Link(LinkError::InvalidAddress(_))));
        assert!(!autd.is_open());

        let (builder, _frames) = RecordingLinkBuilder::new();
        let err = autd.open(builder.start_closed()).unwrap_err();
        assert!(matches!(err, Error::LinkNotOpen));
        assert!(!autd.is_open());
    }

    #[test]
    fn test_reopen_replaces_link() {
        let autd = controller(FrameLayout::new(4, 2), 1);
        let (first, first_frames) = RecordingLinkBuilder::new();
        let (second, second_frames) = RecordingLinkBuilder::new();

        autd.open(first).unwrap();
        autd.open(second).unwrap();
        // the first link received the null gain on close
        assert_eq!(first_frames.try_iter().count(), 1);

        autd.append_gain(TaggedGain::new(9).0).unwrap();
        assert!(recv(&second_frames).payload().iter().all(|&b| b == 9));
    }

    #[test]
    fn test_silent_mode_applies_to_frames() {
        let autd = controller(FrameLayout::new(2, 4), 1);
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();
        assert!(!autd.silent_mode());

        autd.set_silent_mode(true);
        autd.append_gain_sync(NullGain::new()).unwrap();
        assert!(frames
            .try_recv()
            .unwrap()
            .control_flags()
            .contains(ControlFlags::SILENT));
    }

    #[test]
    fn test_geometry_locked_while_open() {
        let autd = controller(FrameLayout::default(), 1);
        let (builder, _frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();
        assert!(matches!(
            autd.set_geometry(Geometry::with_devices(2)),
            Err(Error::GeometryLocked)
        ));

        autd.close().unwrap();
        autd.set_geometry(Geometry::with_devices(2)).unwrap();
        assert_eq!(autd.geometry().num_devices(), 2);
    }

    #[test]
    fn test_bounded_queue_rejects() {
        let autd = controller_with(
            FrameLayout::new(2, 4),
            1,
            QueuePolicy::Bounded {
                capacity: 1,
                overflow: OverflowPolicy::Reject,
            },
        );
        let (builder, _frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();

        let (release_tx, release_rx) = bounded(1);
        autd.append_gain(BlockingGain {
            release: release_rx,
            block: None,
        })
        .unwrap();
        assert!(wait_until(|| autd.remaining_work() == 0));

        autd.append_gain(NullGain::new()).unwrap();
        let err = autd.append_gain(NullGain::new()).unwrap_err();
        assert!(matches!(err, Error::QueueFull { queue: "build", capacity: 1 }));

        release_tx.send(()).unwrap();
        autd.close().unwrap();
    }

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let autd = controller_with(
            FrameLayout::new(2, 4),
            1,
            QueuePolicy::Bounded {
                capacity: 1,
                overflow: OverflowPolicy::DropOldest,
            },
        );
        let (builder, frames) = RecordingLinkBuilder::new();
        autd.open(builder).unwrap();

        let (release_tx, release_rx) = bounded(1);
        autd.append_gain(BlockingGain {
            release: release_rx,
            block: None,
        })
        .unwrap();
        assert!(wait_until(|| autd.remaining_work() == 0));

        autd.append_gain(TaggedGain::new(1).0).unwrap();
        autd.append_gain(TaggedGain::new(2).0).unwrap();
        assert_eq!(autd.stats().dropped_entries, 1);

        release_tx.send(()).unwrap();
        assert!(recv(&frames).payload().iter().all(|&b| b == 0));
        assert!(recv(&frames).payload().iter().all(|&b| b == 2));
    }
}
