//! Send stage
//!
//! Merges the front gain and the front modulation into one frame per
//! iteration. A modulation stays at the head of its queue until every
//! chunk has been transmitted.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use super::Shared;
use crate::error::{Error, LinkError};
use crate::gain::BoundGain;
use crate::modulation::Modulation;

struct SendJob {
    gain: Option<BoundGain>,
    modulation: Option<Modulation>,
    epoch: u64,
}

pub(super) fn spawn(shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("autd-send".to_string())
        .spawn(move || run(&shared))
}

fn run(shared: &Shared) {
    debug!("send stage started");
    while let Some(job) = next_job(shared) {
        if let Err(e) = process(shared, job) {
            shared.fail_session(e);
            break;
        }
    }
    shared.end_if_link_closed();
    debug!("send stage stopped");
}

fn next_job(shared: &Shared) -> Option<SendJob> {
    let mut queues = shared.send.lock();
    loop {
        if !shared.is_open() {
            return None;
        }
        if !queues.is_empty() {
            return Some(SendJob {
                gain: queues.gains.pop_front(),
                modulation: queues.mods.pop_front(),
                epoch: shared.epoch(),
            });
        }
        shared.send_cond.wait(&mut queues);
    }
}

fn process(shared: &Shared, job: SendJob) -> Result<(), Error> {
    let SendJob {
        gain,
        mut modulation,
        epoch,
    } = job;

    let frame = shared.encoder.encode(gain.as_ref(), modulation.as_mut())?;
    if !shared.transmit(&frame)? {
        if !shared.is_running() {
            return Ok(());
        }
        return Err(LinkError::NotOpen.into());
    }
    trace!(
        msg_id = frame.msg_id(),
        mod_size = frame.mod_size(),
        devices = frame.num_device_blocks(),
        "frame sent"
    );

    if let Some(modulation) = modulation {
        if modulation.is_drained() {
            debug!(len = modulation.len(), "modulation pass complete");
            return Ok(());
        }
        let mut queues = shared.send.lock();
        if epoch == shared.epoch() && shared.is_running() {
            queues.mods.push_front(modulation);
        }
    }
    Ok(())
}
