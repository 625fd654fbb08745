//! VMThunder agent
//!
//! Runs on every compute host: owns the host's volume sessions, keeps
//! them in step with the tracker and serves the control API.

mod api;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmthunder_common::Config;
use vmthunder_core::{Backends, SessionManager, SessionOptions, heartbeat_loop};
use vmthunder_drivers::{CommandRunner, DmSetup, FlashCacheGroup, IscsiConnector, TgtAdm, host};
use vmthunder_tracker::HttpTracker;

#[derive(Parser, Debug)]
#[command(name = "vmthunder-agent")]
#[command(about = "VMThunder host agent")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/vmthunder/agent.toml")]
    config: String,

    /// Control API listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Tracker endpoint
    #[arg(long, env = "VMTHUNDER_TRACKER")]
    tracker: Option<String>,

    /// Address advertised to the tracker (overrides interface lookup)
    #[arg(long)]
    host_address: Option<String>,

    /// Interface whose IPv4 address is advertised
    #[arg(long)]
    interface: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str =
        std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
    toml::from_str(&config_str).with_context(|| format!("parse config {path}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    if let Some(listen) = args.listen {
        config.agent.listen = listen;
    }
    if let Some(tracker) = args.tracker {
        config.tracker.endpoint = tracker;
    }
    if let Some(address) = args.host_address {
        config.host.address = Some(address);
    }
    if let Some(interface) = args.interface {
        config.host.interface = interface;
    }
    let log_level = if args.log_level == "info" {
        config.agent.log_level.clone()
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting VMThunder agent");
    info!("Config file: {}", args.config);

    let host_address = host::advertised_address(&config.host).context("resolve host address")?;
    info!("Advertising {}:{} to tracker {}", host_address, config.host.iscsi_port, config.tracker.endpoint);

    // Collaborators are built once and shared by every session.
    let runner = CommandRunner::new(config.storage.root_helper.clone());
    let tracker = HttpTracker::new(&config.tracker).context("build tracker client")?;
    let backends = Backends {
        mapper: Arc::new(DmSetup::new(runner.clone(), config.storage.dm_prefix.clone())),
        targets: Arc::new(TgtAdm::new(runner.clone(), config.host.export_lun)),
        connector: Arc::new(IscsiConnector::new(
            runner.clone(),
            config.storage.device_wait(),
        )),
        cache: Arc::new(FlashCacheGroup::new(
            runner,
            config.storage.cache_group.clone(),
            config.storage.dm_prefix.clone(),
        )),
        tracker: Arc::new(tracker),
    };
    let options = SessionOptions::from_config(&config, host_address);
    let manager = Arc::new(SessionManager::new(
        backends,
        options,
        config.tracker.deploy_timeout(),
    ));

    tokio::spawn(heartbeat_loop(
        Arc::clone(&manager),
        config.tracker.heartbeat_interval(),
    ));

    let addr: SocketAddr = config
        .agent
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", config.agent.listen, e))?;
    info!("Control API on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, api::router(Arc::clone(&manager)))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    manager.shutdown().await;
    info!("Agent shut down gracefully");

    Ok(())
}
