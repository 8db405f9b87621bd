//! AirClip node entry point.
//!
//! Wires discovery to transfer and runs headless: inbound messages are
//! logged, and every non-empty line typed on stdin is broadcast to all
//! connected peers.  With `--write-config` it instead saves the effective
//! configuration and exits.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load config (file, then CLI/env overrides)
//!  └─ Postman::start()            -- TCP listener + reaper
//!  └─ DiscoveryService::start()   -- UDP receive loop + ticker
//!  └─ spawn_peer_sync()           -- discovery events → Postman
//!  └─ spawn_failure_feedback()    -- dead links → DiscoveryService::forget
//!  └─ inbound printer + stdin broadcaster, until Ctrl-C
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use airclip_core::EndPoint;
use airclip_node::application::peer_sync::{spawn_failure_feedback, spawn_peer_sync};
use airclip_node::infrastructure::network::discovery::DiscoveryService;
use airclip_node::infrastructure::network::postman::Postman;
use airclip_node::infrastructure::storage::config::{
    config_file_path, load_config, load_config_from, save_config_to, AppConfig,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// AirClip LAN node.
///
/// Finds other nodes on the local network and exchanges text with them.
/// Flags override values from the configuration file.
#[derive(Debug, Parser)]
#[command(
    name = "airclip-node",
    about = "Serverless LAN peer discovery and text transfer",
    version
)]
struct Cli {
    /// Path to a TOML configuration file.  Defaults to the platform config
    /// directory.
    #[arg(long, env = "AIRCLIP_CONFIG")]
    config: Option<PathBuf>,

    /// Display name advertised to peers.
    #[arg(long, env = "AIRCLIP_NAME")]
    name: Option<String>,

    /// Device name advertised to peers.
    #[arg(long, env = "AIRCLIP_DEVICE")]
    device: Option<String>,

    /// UDP port for presence broadcasts.
    #[arg(long, env = "AIRCLIP_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    /// TCP port for transfer connections.
    #[arg(long, env = "AIRCLIP_TRANSFER_PORT")]
    transfer_port: Option<u16>,

    /// Seconds between presence broadcasts.
    #[arg(long, env = "AIRCLIP_INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Write the effective configuration (file plus overrides) to the config
    /// path and exit.
    #[arg(long)]
    write_config: bool,
}

impl Cli {
    /// Loads the configuration file this invocation points at.
    fn load(&self) -> anyhow::Result<AppConfig> {
        let config = match &self.config {
            Some(path) => load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => load_config().context("failed to load config")?,
        };
        Ok(config)
    }

    /// The file `--config` points at, or the platform default.
    fn config_path(&self) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => config_file_path().context("failed to resolve config path"),
        }
    }

    /// Saves `config` to [`config_path`](Self::config_path) and returns the
    /// path written.
    fn write_config(&self, config: &AppConfig) -> anyhow::Result<PathBuf> {
        let path = self.config_path()?;
        save_config_to(config, &path)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(path)
    }

    /// Applies flag overrides on top of file values.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(name) = &self.name {
            config.node.name = name.clone();
        }
        if let Some(device) = &self.device {
            config.node.device_name = device.clone();
        }
        if let Some(port) = self.discovery_port {
            config.discovery.port = port;
        }
        if let Some(port) = self.transfer_port {
            config.transfer.port = port;
        }
        if let Some(secs) = self.interval_secs {
            config.discovery.interval_secs = secs;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = cli.load()?;
    cli.apply(&mut config);

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .init();

    if cli.write_config {
        let path = cli.write_config(&config)?;
        info!("wrote configuration to {}", path.display());
        return Ok(());
    }

    let self_info = EndPoint::local(&config.node.name, &config.node.device_name);
    info!("AirClip node {} starting", self_info.label());

    // ── Transfer ──────────────────────────────────────────────────────────────
    let postman = Postman::new(config.transfer_config()?, self_info);
    postman
        .start()
        .await
        .context("failed to start transfer service")?;
    let mut inbound = postman
        .take_inbound()
        .context("inbound receiver already taken")?;

    // ── Discovery ─────────────────────────────────────────────────────────────
    let discovery = DiscoveryService::new(config.discovery_config()?, postman.self_info());
    let events = discovery
        .take_events()
        .context("discovery event receiver already taken")?;
    let sync = spawn_peer_sync(events, Arc::new(postman.clone()));
    let failures = postman
        .take_link_failures()
        .context("link failure receiver already taken")?;
    let feedback = spawn_failure_feedback(failures, Arc::new(discovery.clone()));
    discovery
        .start()
        .await
        .context("failed to start discovery service")?;

    // ── Inbound printer ───────────────────────────────────────────────────────
    let printer = tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let sender = message.sender().unwrap_or("unknown");
            info!("[{sender}] {}", message.content());
        }
    });

    info!("AirClip node ready.  Type a line to broadcast it; Ctrl-C to exit.");

    // ── Stdin broadcaster / shutdown ──────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("failed to listen for Ctrl-C: {e}");
                }
                info!("shutdown signal received");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        let accepted = postman.broadcast(line);
                        info!("sent to {accepted} peer(s)");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    stdin_open = false;
                }
            },
        }
    }

    discovery.announce_offline().await;
    discovery.stop();
    postman.stop();
    sync.abort();
    feedback.abort();
    printer.abort();

    info!("AirClip node stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
