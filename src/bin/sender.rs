//! Frame Sender Application
//!
//! Streams a sine modulation and a rotating focus pattern to a receiver
//! over UDP.
//!
//! Usage: `sender [target] [config.toml]`

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::f32::consts::PI;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autd_stream::{
    constants::NUM_TRANS_IN_UNIT,
    link::UdpLinkBuilder,
    AppConfig, Controller, DeviceId, Gain, Geometry, Modulation,
};

/// Number of pattern gains streamed before closing
const CYCLES: usize = 200;

/// Interval between pattern updates
const UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Drive pattern with a phase offset that rotates along the array
struct PatternGain {
    step: usize,
    blocks: HashMap<DeviceId, Vec<u8>>,
    built: bool,
}

impl PatternGain {
    fn new(step: usize) -> Self {
        Self {
            step,
            blocks: HashMap::new(),
            built: false,
        }
    }
}

impl Gain for PatternGain {
    fn build(&mut self, geometry: &Geometry, block_size: usize) {
        let transducers = (block_size / 2).min(NUM_TRANS_IN_UNIT);
        self.blocks = geometry
            .iter()
            .enumerate()
            .map(|(index, device)| {
                let mut block = vec![0u8; block_size];
                for t in 0..transducers {
                    let phase = ((self.step + index * transducers + t) % 256) as u16;
                    let duty: u16 = 0xFF;
                    let word = (duty << 8) | phase;
                    block[t * 2..t * 2 + 2].copy_from_slice(&word.to_le_bytes());
                }
                (device, block)
            })
            .collect();
        self.built = true;
    }

    fn is_built(&self) -> bool {
        self.built
    }

    fn payload(&self, device: DeviceId) -> Option<&[u8]> {
        self.blocks.get(&device).map(Vec::as_slice)
    }
}

/// One period of a sine modulation, `len` samples
fn sine_modulation(len: usize) -> Modulation {
    let buffer = (0..len)
        .map(|i| {
            let x = (2.0 * PI * i as f32 / len as f32).sin();
            ((x + 1.0) * 127.5) as u8
        })
        .collect::<Vec<u8>>();
    Modulation::new(buffer)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AUTD frame sender");

    let mut args = std::env::args().skip(1);
    let target = args.next();
    let config_path = args.next().map(PathBuf::from);

    let mut config =
        AppConfig::load_or_default(config_path.as_deref()).context("Failed to load config")?;
    if let Some(target) = target {
        config.udp.target = target;
    }

    let geometry = Geometry::with_devices(config.devices);
    let autd = Controller::new(geometry, config.controller.clone())?;

    let mut link = UdpLinkBuilder::new(config.udp.target.clone());
    if let Some(size) = config.udp.send_buffer_size {
        link = link.with_send_buffer_size(size);
    }
    autd.open(link)
        .with_context(|| format!("Failed to open link to {}", config.udp.target))?;

    tracing::info!(
        "Streaming to {} ({} devices, silent mode {})",
        config.udp.target,
        config.devices,
        autd.silent_mode()
    );

    // Prime the devices with a full modulation pass before streaming gains
    let mut modulation = sine_modulation(400);
    autd.append_modulation_sync(&mut modulation)?;

    let started = Instant::now();
    for step in 0..CYCLES {
        autd.append_gain(PatternGain::new(step))?;
        if step % 50 == 0 {
            autd.append_modulation(modulation.clone())?;
        }
        std::thread::sleep(UPDATE_INTERVAL);

        if !autd.is_open() {
            anyhow::bail!("Link closed while streaming");
        }
    }

    while autd.remaining_work() > 0 && autd.is_open() {
        std::thread::sleep(Duration::from_millis(1));
    }

    let stats = autd.stats();
    tracing::info!(
        "Sent {} frames ({} bytes) in {:.2?}, avg frame {:.1} bytes, {} dropped",
        stats.frames_sent,
        stats.bytes_sent,
        started.elapsed(),
        stats.encoder.average_frame_size,
        stats.dropped_entries
    );

    autd.close()?;
    tracing::info!("Sender stopped");
    Ok(())
}
