//! guestd-agent: in-guest reconciliation daemon.
//!
//! This daemon runs inside each VM and:
//! - Fetches the desired-state descriptor from the metadata service
//! - Long-polls for descriptor changes
//! - Fans each update out to per-concern managers (addresses, clock,
//!   OS login) that converge local OS state
//! - Keeps running through reconciliation failures; only unrecoverable
//!   startup failures exit the process

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use guestd_agent::agent::GuestAgent;
use guestd_agent::config::AgentConfig;
use guestd_agent::manager::addresses::{AddressManager, RouteBackend};
use guestd_agent::manager::clock::ClockManager;
use guestd_agent::manager::oslogin::OsLoginManager;
use guestd_agent::manager::Manager;
use guestd_agent::metadata::client::MetadataClient;
use guestd_agent::os::linux::{LinuxClock, LinuxInterfaces, LinuxOsLogin, LinuxRoutes};

/// guestd reconciliation agent
#[derive(Parser, Debug)]
#[command(name = "guestd-agent", version, about)]
struct Args {
    /// Metadata service endpoint
    #[arg(long, default_value = "http://169.254.169.254")]
    metadata_endpoint: String,

    /// Agent configuration file
    #[arg(long, default_value = "/etc/guestd/guestd.toml")]
    config: PathBuf,
}

/// Fixed manager set for this OS family, built once at startup.
fn platform_managers() -> Vec<Arc<dyn Manager>> {
    let interfaces = Arc::new(LinuxInterfaces);
    let backend = Arc::new(RouteBackend::new(Arc::new(LinuxRoutes)));
    vec![
        Arc::new(AddressManager::new(interfaces, backend, false)),
        Arc::new(ClockManager::new(Arc::new(LinuxClock))),
        Arc::new(OsLoginManager::new(Arc::new(LinuxOsLogin))),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guestd_agent=info,guestd_events=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    info!("starting guestd agent on {host}");
    info!("metadata endpoint: {}", args.metadata_endpoint);

    let config =
        Arc::new(AgentConfig::load(&args.config).context("failed to load configuration")?);
    let source = Arc::new(
        MetadataClient::new(&args.metadata_endpoint)
            .context("failed to build metadata client")?,
    );

    let cancel = CancellationToken::new();

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        }
        shutdown.cancel();
    });

    let agent = GuestAgent::new(source, platform_managers(), config);
    agent.start(cancel).await?;

    info!("agent stopped");
    Ok(())
}
