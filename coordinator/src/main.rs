//! Rendezvous Coordinator Service
//!
//! This binary runs the coordination service a multi-host job talks to
//! while it boots: nodes register their devices, synchronize on barriers,
//! send heartbeats and exchange small metadata blobs.
//!
//! # Usage
//!
//! ```bash
//! # Coordinate a four-node cluster
//! rendezvous-coordinator --cluster-size 4
//!
//! # Start with custom port
//! rendezvous-coordinator --cluster-size 4 --port 50052
//!
//! # Start with configuration file
//! rendezvous-coordinator --config coordinator.toml
//! ```

mod service;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rendezvous_core::config::{CoordinatorConfig, RendezvousConfig, SliceIndexPolicy};
use rendezvous_core::coordinator::proto::coordinator_service_server::CoordinatorServiceServer;
use service::CoordinatorServiceImpl;
use state::Coordinator;

/// Rendezvous Coordinator
#[derive(Parser, Debug)]
#[command(name = "rendezvous-coordinator")]
#[command(about = "Coordination service for multi-host cluster bring-up")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(short, long)]
    address: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of nodes in the cluster
    #[arg(short = 'n', long)]
    cluster_size: Option<u32>,

    /// Heartbeat interval recommended to nodes, in milliseconds
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Missed heartbeats tolerated before a node is marked unhealthy
    #[arg(long)]
    max_missing_heartbeats: Option<u32>,

    /// Time allowed for all nodes to register, in seconds
    #[arg(long)]
    registration_timeout_secs: Option<u64>,

    /// Slice index derivation (boot_id, per_node, single)
    #[arg(long)]
    slice_policy: Option<SliceIndexPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut CoordinatorConfig) {
        if self.address.is_some() || self.port.is_some() {
            let (default_host, default_port) = config
                .listen_address
                .rsplit_once(':')
                .unwrap_or(("0.0.0.0", "50051"));
            let host = self.address.as_deref().unwrap_or(default_host);
            let port = self
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| default_port.to_string());
            config.listen_address = format!("{}:{}", host, port);
        }
        if let Some(cluster_size) = self.cluster_size {
            config.cluster_size = cluster_size;
        }
        if let Some(interval) = self.heartbeat_interval_ms {
            config.heartbeat_interval_ms = interval;
            config.sweep_interval_ms = config.sweep_interval_ms.min(interval);
        }
        if let Some(missing) = self.max_missing_heartbeats {
            config.max_missing_heartbeats = missing;
        }
        if let Some(secs) = self.registration_timeout_secs {
            config.registration_timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(policy) = self.slice_policy {
            config.slice_index_policy = policy;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => RendezvousConfig::from_file(path)?,
        None => RendezvousConfig::default(),
    }
    .with_env_overrides();
    args.apply(&mut config.coordinator);
    config.coordinator.validate()?;

    let coordinator = Arc::new(Coordinator::new(config.coordinator.clone()));
    let settings = coordinator.config();

    tracing::info!("Starting Rendezvous Coordinator");
    tracing::info!("  Session: {}", coordinator.session_id());
    tracing::info!("  Cluster size: {}", settings.cluster_size);
    tracing::info!(
        "  Heartbeat interval: {}ms (unhealthy after {} missed)",
        settings.heartbeat_interval_ms,
        settings.max_missing_heartbeats
    );
    tracing::info!("  Registration timeout: {:?}", settings.registration_timeout());
    tracing::info!("  Slice policy: {:?}", settings.slice_index_policy);

    let service = CoordinatorServiceImpl::new(coordinator.clone());
    let addr: SocketAddr = settings.listen_address.parse()?;

    tracing::info!("Listening on {}", addr);

    // Liveness sweep
    let sweeper = coordinator.clone();
    let session_done = coordinator.shutdown_token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweeper.config().sweep_interval());
        loop {
            tokio::select! {
                _ = session_done.cancelled() => break,
                _ = interval.tick() => {
                    for event in sweeper.sweep_liveness().await {
                        tracing::debug!(
                            "Node {} went {:?} -> {:?}",
                            event.node_id,
                            event.previous,
                            event.current
                        );
                    }
                }
            }
        }
    });

    // Start gRPC server
    let session_done = coordinator.shutdown_token();
    Server::builder()
        .add_service(CoordinatorServiceServer::new(service))
        .serve_with_shutdown(addr, async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        tracing::error!("Failed to listen for CTRL+C: {}", e);
                    }
                    tracing::info!("Shutting down coordinator...");
                }
                _ = session_done.cancelled() => {
                    tracing::info!("Session complete, shutting down coordinator...");
                }
            }
        })
        .await?;

    Ok(())
}
