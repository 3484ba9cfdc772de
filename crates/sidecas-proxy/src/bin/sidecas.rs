//! The sidecas daemon: a local cache proxy for remote CAS

use clap::Parser;
use sidecas_proxy::config::{
    AtimeConfig, GetTreeConfig, HitTrackerConfig, ProxyConfig, RemoteConfig,
};
use sidecas_proxy::lifecycle::CacheProxy;
use sidecas_store::MemoryBlobStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sidecas", about = "Local cache proxy for remote content-addressable storage")]
struct Args {
    /// Address to serve the proxy on
    #[arg(long, default_value = "127.0.0.1:1985")]
    listen: SocketAddr,

    /// Remote CAS endpoint (e.g. grpcs://cas.example.com)
    #[arg(long)]
    remote_endpoint: String,

    /// Instance name for the remote CAS
    #[arg(long, default_value = "default")]
    instance_name: String,

    /// API key the proxy authenticates with
    #[arg(long)]
    api_key: Option<String>,

    /// Enable the GetTree tree cache
    #[arg(long, default_value_t = true)]
    enable_get_tree_caching: bool,

    /// Flush period for remote atime updates, in milliseconds
    #[arg(long, default_value_t = 60_000)]
    remote_atime_update_interval_ms: u64,

    /// Telemetry endpoint for hit tracking; empty disables it
    #[arg(long, default_value = "")]
    remote_hit_tracker_target: String,

    /// Flush period for hit tracking, in milliseconds
    #[arg(long, default_value_t = 250)]
    remote_hit_tracker_update_interval_ms: u64,

    /// Maximum pending hit records per tenant
    #[arg(long, default_value_t = 2_500_000)]
    remote_hit_tracker_max_pending_hits_per_group: usize,

    /// Maximum hit records per outbound RPC
    #[arg(long, default_value_t = 250_000)]
    remote_hit_tracker_max_hits_per_update: usize,

    /// Hit-tracking worker count; below 1 disables hit tracking
    #[arg(long, default_value_t = 1)]
    remote_hit_tracker_workers: usize,

    /// Deadline for the best-effort drain on shutdown, in seconds
    #[arg(long, default_value_t = 10)]
    shutdown_deadline_secs: u64,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl Args {
    fn to_config(&self) -> ProxyConfig {
        ProxyConfig {
            remote: RemoteConfig {
                endpoint: self.remote_endpoint.clone(),
                instance_name: self.instance_name.clone(),
                api_key: self.api_key.clone(),
                ..Default::default()
            },
            get_tree: GetTreeConfig {
                enable_caching: self.enable_get_tree_caching,
                ..Default::default()
            },
            atime: AtimeConfig {
                update_interval_ms: self.remote_atime_update_interval_ms,
                ..Default::default()
            },
            hit_tracker: HitTrackerConfig {
                target: self.remote_hit_tracker_target.clone(),
                update_interval_ms: self.remote_hit_tracker_update_interval_ms,
                max_pending_hits_per_group: self.remote_hit_tracker_max_pending_hits_per_group,
                max_hits_per_update: self.remote_hit_tracker_max_hits_per_update,
                workers: self.remote_hit_tracker_workers,
                ..Default::default()
            },
            shutdown_deadline_secs: self.shutdown_deadline_secs,
        }
    }
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Resolves once the process is asked to stop
///
/// The server drives this future directly: when it resolves, the
/// listener closes and the background pipelines get their drain window.
async fn shutdown_signal() {
    #[cfg(unix)]
    let signal_name = {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut term, mut int) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Signal handlers unavailable, only SIGKILL will stop this process");
                std::future::pending::<()>().await;
                unreachable!()
            }
        };

        tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        }
    };

    #[cfg(not(unix))]
    let signal_name = {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    };

    info!(signal = signal_name, "Stop requested, draining background queues before exit");
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = args.to_config();
    let store = Arc::new(MemoryBlobStore::new());
    let proxy = CacheProxy::connect(config, store).await?;

    proxy.serve(args.listen, shutdown_signal()).await?;

    info!("Shutdown complete");
    Ok(())
}
