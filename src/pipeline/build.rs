//! Build stage
//!
//! Pops gains from the build queue, calculates them outside the lock and
//! forwards them to the send stage.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::queue::Push;
use super::Shared;
use crate::gain::BoundGain;

pub(super) fn spawn(shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("autd-build".to_string())
        .spawn(move || run(&shared))
}

fn run(shared: &Shared) {
    debug!("build stage started");
    while let Some((mut gain, epoch)) = next_gain(shared) {
        gain.build();
        forward(shared, gain, epoch);
    }
    shared.end_if_link_closed();
    debug!("build stage stopped");
}

/// Block until a gain is pending; `None` once the session stops or the
/// link reports closed
fn next_gain(shared: &Shared) -> Option<(BoundGain, u64)> {
    let mut queue = shared.build.lock();
    loop {
        if !shared.is_open() {
            return None;
        }
        if let Some(gain) = queue.pop_front() {
            return Some((gain, shared.epoch()));
        }
        shared.build_cond.wait(&mut queue);
    }
}

fn forward(shared: &Shared, gain: BoundGain, epoch: u64) {
    let mut queues = shared.send.lock();
    if epoch != shared.epoch() || !shared.is_running() {
        debug!("discarding gain built across a flush");
        return;
    }
    match queues.gains.push(gain) {
        Push::Queued => {}
        Push::Displaced(_) => {
            shared.note_dropped();
            warn!("send gain queue full, dropped oldest gain");
        }
        Push::Rejected(_) => {
            shared.note_dropped();
            warn!("send gain queue full, discarded built gain");
        }
    }
    drop(queues);
    shared.send_cond.notify_all();
}
