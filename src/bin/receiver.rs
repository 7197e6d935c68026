//! Frame Receiver Application
//!
//! Stands in for the device chain: receives frames over UDP, validates
//! them and reassembles modulation passes.
//!
//! Usage: `receiver [bind] [config.toml]`

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autd_stream::{
    codec::{ControlFlags, FrameDecoder, ModulationAssembler},
    constants::MAX_DATAGRAM_SIZE,
    link::create_socket,
    AppConfig,
};

/// Interval between statistics reports
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Sized for any datagram, whatever chain length the sender streams to
fn receive_buffer() -> Vec<u8> {
    vec![0u8; MAX_DATAGRAM_SIZE]
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AUTD frame receiver");

    let mut args = std::env::args().skip(1);
    let bind = args.next();
    let config_path = args.next().map(PathBuf::from);

    let mut config =
        AppConfig::load_or_default(config_path.as_deref()).context("Failed to load config")?;
    if let Some(bind) = bind {
        config.udp.bind = bind;
    }

    let bind_addr: SocketAddr = config
        .udp
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.udp.bind))?;
    let socket = create_socket(bind_addr, None, config.udp.recv_buffer_size)
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;

    let layout = config.controller.layout;
    tracing::info!(
        "Listening on {} (header {} bytes, device block {} bytes)",
        bind_addr,
        layout.header_size(),
        layout.device_block_size
    );

    let mut decoder = FrameDecoder::new(layout);
    let mut assembler = ModulationAssembler::new();
    let mut buf = receive_buffer();
    let mut passes = 0u64;
    let mut last_report = Instant::now();

    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => match decoder.decode(&buf[..len]) {
                Ok(frame) => {
                    let flags = frame.control_flags();
                    tracing::debug!(
                        %from,
                        msg_id = frame.msg_id(),
                        flags = flags.bits(),
                        silent = flags.contains(ControlFlags::SILENT),
                        mod_size = frame.mod_size(),
                        devices = frame.num_device_blocks(),
                        "frame received"
                    );
                    if let Some(pass) = assembler.feed(&frame) {
                        passes += 1;
                        tracing::info!("Modulation pass complete: {} samples", pass.len());
                    }
                }
                Err(e) => tracing::warn!(%from, error = %e, "rejected frame"),
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e).context("Receive failed"),
        }

        if last_report.elapsed() >= STATS_INTERVAL {
            let stats = decoder.stats();
            tracing::info!(
                "Frames: {} ok, {} rejected, last msg id {:?}, {} passes, {} broken",
                stats.frames_decoded,
                stats.frames_rejected,
                stats.last_msg_id,
                passes,
                assembler.broken_passes()
            );
            last_report = Instant::now();
        }
    }
}
