//! LanScope viewer: entry point.
//!
//! Listens for relays, advertises itself on the LAN and logs every HTTP
//! request the relays forward.  Packets are kept in memory for the lifetime
//! of the process.
//!
//! # Usage
//!
//! ```text
//! lanscope-viewer [OPTIONS]
//!
//! Options:
//!   --bind               <IP>    Listener bind address [default: 0.0.0.0]
//!   --port               <PORT>  Listener TCP port [default: 43435]
//!   --name               <NAME>  Advertised instance name [default: lanscope-viewer]
//!   --discovery-port     <PORT>  UDP announcement port [default: 43434]
//!   --broadcast          <IP>    Announcement destination [default: 255.255.255.255]
//!   --announce-interval  <MS>    Announcement period in ms [default: 1000]
//!   --max-frame-len      <BYTES> Largest accepted packet [default: 32 MiB]
//! ```
//!
//! Every option can also be set through the environment variable shown in
//! `--help` (`LANSCOPE_VIEWER_PORT`, `LANSCOPE_DISCOVERY_PORT`, ...).  CLI args
//! take precedence.

use std::net::{IpAddr, SocketAddr};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lanscope_core::DEFAULT_MAX_FRAME_LEN;
use lanscope_viewer::application::{handle_event, PacketStore};
use lanscope_viewer::domain::config::{
    ViewerConfig, DEFAULT_DISCOVERY_PORT, DEFAULT_DOMAIN, DEFAULT_LISTEN_PORT,
    DEFAULT_SERVICE_TYPE,
};
use lanscope_viewer::infrastructure::{bind_listener, run_listener, start_advertiser};

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Headless LanScope viewer.
#[derive(Debug, Parser)]
#[command(
    name = "lanscope-viewer",
    about = "Collects HTTP traffic relayed by LanScope-enabled applications",
    version
)]
struct Cli {
    /// IP address the packet listener binds to.
    #[arg(long, default_value = "0.0.0.0", env = "LANSCOPE_VIEWER_BIND")]
    bind: String,

    /// TCP port relays connect to.  `0` picks a free port.
    #[arg(long, default_value_t = DEFAULT_LISTEN_PORT, env = "LANSCOPE_VIEWER_PORT")]
    port: u16,

    /// Instance name announced to relays.
    #[arg(long, default_value = "lanscope-viewer", env = "LANSCOPE_VIEWER_NAME")]
    name: String,

    #[arg(long, default_value = DEFAULT_SERVICE_TYPE, env = "LANSCOPE_SERVICE_TYPE")]
    service_type: String,

    #[arg(long, default_value = DEFAULT_DOMAIN, env = "LANSCOPE_DOMAIN")]
    domain: String,

    /// UDP port relays browse on.
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT, env = "LANSCOPE_DISCOVERY_PORT")]
    discovery_port: u16,

    /// Where announcements are sent.  Use a subnet broadcast address (for
    /// example `192.168.1.255`) when the limited broadcast is filtered.
    #[arg(long, default_value = "255.255.255.255", env = "LANSCOPE_BROADCAST_ADDR")]
    broadcast: String,

    /// Announcement period in milliseconds.
    #[arg(long, default_value_t = 1000, env = "LANSCOPE_ANNOUNCE_INTERVAL_MS")]
    announce_interval: u64,

    /// Frames with a larger length header close the connection.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN, env = "LANSCOPE_MAX_FRAME_LEN")]
    max_frame_len: usize,
}

impl Cli {
    /// Converts the parsed arguments into a [`ViewerConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--bind` or `--broadcast` is not an IP address.
    fn into_viewer_config(self) -> anyhow::Result<ViewerConfig> {
        let listen_addr: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid listen address: '{}:{}'", self.bind, self.port))?;

        let broadcast_addr: IpAddr = self
            .broadcast
            .parse()
            .with_context(|| format!("invalid broadcast address: '{}'", self.broadcast))?;

        Ok(ViewerConfig {
            listen_addr,
            service_name: self.name,
            service_type: self.service_type,
            domain: self.domain,
            discovery_port: self.discovery_port,
            broadcast_addr,
            announce_interval: Duration::from_millis(self.announce_interval),
            max_frame_len: self.max_frame_len,
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// # What happens at startup
///
/// 1. Logging is initialised from `RUST_LOG` (default `info`).
/// 2. The listener is bound, so the real port is known even with `--port 0`.
/// 3. The advertiser starts announcing that port.
/// 4. Listener events are applied to the [`PacketStore`] until Ctrl+C.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_viewer_config()?;

    let listener = bind_listener(config.listen_addr).await?;
    let port = listener
        .local_addr()
        .context("failed to read listener address")?
        .port();
    let advertiser = start_advertiser(&config, port)
        .await
        .context("failed to start discovery advertiser")?;
    info!(
        "LanScope viewer '{}' advertising {}.{} on port {port}",
        config.service_name, config.service_type, config.domain
    );

    let running = Arc::new(AtomicBool::new(true));
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let server = tokio::spawn(run_listener(
        listener,
        config.max_frame_len,
        events_tx,
        Arc::clone(&running),
    ));

    let mut store = PacketStore::new();
    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(event) => {
                    handle_event(&mut store, event);
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("received Ctrl+C; shutting down"),
                    Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
                }
                break;
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    advertiser.stop();
    if let Err(e) = server.await {
        error!("listener task failed: {e}");
    }

    info!(
        "LanScope viewer stopped ({} packets from {} projects)",
        store.len(),
        store.project_count()
    );
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
