//! NDT diagnostic server.
//!
//! Listens on the control port, queues clients, and runs the requested
//! Middlebox, firewall, throughput and meta tests for each of them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ndt_diag::HeuristicVersion;
use ndt_server::capture::{CaptureOpener, LiveCaptureOpener};
use ndt_server::{Server, ServerConfigInput, TcpInfoStore};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// NDT network diagnostic server.
#[derive(Parser, Debug)]
#[command(name = "ndt-server", about = "NDT network diagnostic server", version)]
struct Cli {
    /// TOML configuration file. Flags override its values.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Control port. Test ports follow it unless configured.
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Address to bind all listeners to.
    #[arg(long)]
    bind: Option<String>,

    /// Run several clients at once.
    #[arg(long)]
    multiple: bool,

    /// Client cap in multi-client mode.
    #[arg(long)]
    max_clients: Option<usize>,

    /// Reject clients that cannot start immediately.
    #[arg(long)]
    disable_queue: bool,

    /// SO_SNDBUF/SO_RCVBUF for test sockets, in bytes.
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Directory for meta records, the summary log and snaplogs.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Test port ranges for multi-client mode, e.g. "3010-3020,4000-4010".
    #[arg(long)]
    port_range: Option<String>,

    /// Duplex-mismatch heuristic variant.
    #[arg(long)]
    heuristic_version: Option<HeuristicVersion>,

    /// Run the packet-pair observer during throughput tests.
    #[arg(long)]
    packet_trace: bool,

    /// Capture interface. Auto-detected when unset.
    #[arg(long)]
    device: Option<String>,

    /// Write CWND snaplogs for throughput tests.
    #[arg(long)]
    snaplog: bool,

    /// Use the sampler's CWND trend in the summary log.
    #[arg(long)]
    cwnd_decrease: bool,

    /// Pause S2C writes while the send queue is clogged.
    #[arg(long)]
    avoid_sndblock: bool,

    /// Accepted for compatibility. No HTML view is generated.
    #[arg(long)]
    admin_view: bool,
}

impl Cli {
    fn apply(self, input: &mut ServerConfigInput) {
        if self.port.is_some() {
            input.ports.control = self.port;
        }
        if self.bind.is_some() {
            input.bind_addr = self.bind;
        }
        if self.multiple {
            input.multiple = Some(true);
        }
        if self.max_clients.is_some() {
            input.max_clients = self.max_clients;
        }
        if self.disable_queue {
            input.queue = Some(false);
        }
        if self.buffer_size.is_some() {
            input.tcp_buffer_size = self.buffer_size;
        }
        if self.log_dir.is_some() {
            input.log_dir = self.log_dir;
        }
        if self.port_range.is_some() {
            input.ports.range = self.port_range;
        }
        if self.heuristic_version.is_some() {
            input.heuristic_version = self.heuristic_version;
        }
        if self.packet_trace {
            input.capture.enabled = Some(true);
        }
        if self.device.is_some() {
            input.capture.device = self.device;
        }
        if self.snaplog {
            input.snaplog = Some(true);
        }
        if self.cwnd_decrease {
            input.cwnd_decrease = Some(true);
        }
        if self.avoid_sndblock {
            input.avoid_snd_blockup = Some(true);
        }
        if self.admin_view {
            input.admin_view = Some(true);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut input = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            ServerConfigInput::from_toml_str(&text).map_err(anyhow::Error::msg)?
        }
        None => ServerConfigInput::default(),
    };
    cli.apply(&mut input);
    let config = input.resolve().map_err(anyhow::Error::msg)?;

    if config.syslog {
        tracing::warn!(
            facility = config.syslog_facility.as_deref().unwrap_or("daemon"),
            "syslog output not supported, logging to stderr"
        );
    }
    if config.admin_view {
        tracing::info!("admin view requested; no HTML view is generated");
    }

    let capture: Option<Arc<dyn CaptureOpener>> = config.capture.enabled.then(|| {
        Arc::new(LiveCaptureOpener {
            device: config.capture.device.clone(),
        }) as Arc<dyn CaptureOpener>
    });

    tracing::info!(
        control = config.ports.control,
        c2s = config.ports.c2s,
        middlebox = config.ports.middlebox,
        s2c = config.ports.s2c,
        concurrency = config.concurrency(),
        capture = config.capture.enabled,
        "ndt-server starting"
    );

    let server = Server::bind(config, Arc::new(TcpInfoStore), capture)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(server.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
            handle.await??;
        }
        result = &mut handle => {
            result??;
        }
    }

    Ok(())
}
