//! The appliance configuration daemon.
//!
//! Recovers the property tree from the data directory, then serves it to
//! co-located daemons over the local RPC socket while the expiry
//! scheduler, compactor, and (when a site identity is configured) the
//! cloud reconciler run alongside. SIGINT/SIGTERM trigger a graceful
//! drain: late requests are refused, in-flight work finishes, the bus
//! flushes its buffers, and every task stops.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cfgplane_core::{ClockSource, SystemClock, ValidationRule, Validator, ValueType};
use cfgplane_server::engine::ConfigEngine;
use cfgplane_server::expiry::{run_expiry, ExpirySchedule};
use cfgplane_server::notify::NotificationBus;
use cfgplane_server::queue::{run_lease_reaper, CommandStore, MemoryCommandStore};
use cfgplane_server::reconcile::{Reconciler, StoreChannel};
use cfgplane_server::rpc::LrpcServer;
use cfgplane_server::shutdown::ShutdownCoordinator;
use cfgplane_server::store::{self, SnapshotStore, SNAPSHOT_FILE};
use cfgplane_server::ServerConfig;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::UnixListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "cfgd", about = "appliance configuration daemon")]
struct Args {
    /// Directory holding tree.snap and tree.jrn.
    #[arg(long, env = "CFGD_DATA_DIR", default_value = "/var/lib/cfgd")]
    data_dir: PathBuf,

    /// UNIX-domain socket for the local RPC endpoint.
    #[arg(long, env = "CFGD_SOCKET", default_value = "/run/cfgd/cfgd.sock")]
    socket: PathBuf,

    /// JSON schema file extending the baseline validation rules.
    #[arg(long, env = "CFGD_SCHEMA")]
    schema: Option<PathBuf>,

    /// Site identity; enables the cloud reconciler.
    #[arg(long, env = "CFGD_SITE")]
    site: Option<Uuid>,

    /// Prometheus exporter listen address (disabled when absent).
    #[arg(long, env = "CFGD_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, env = "CFGD_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).context("bad --log filter")?)
        .init();

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("metrics exporter")?;
        tracing::info!(%addr, "prometheus exporter listening");
    }

    let validator = Arc::new(Validator::with_baseline());
    if let Some(schema_path) = &args.schema {
        let json = std::fs::read_to_string(schema_path)
            .with_context(|| format!("schema file {}", schema_path.display()))?;
        let count = validator
            .load_schema(&json)
            .context("schema file rejected")?;
        tracing::info!(count, path = %schema_path.display(), "schema rules loaded");
    }
    register_own_settings(&validator)?;

    let config = ServerConfig {
        data_dir: args.data_dir.clone(),
        socket_path: args.socket.clone(),
        schema_path: args.schema.clone(),
        ..ServerConfig::default()
    };

    let data_dir = config.data_dir.clone();
    let (tree, journal, report) =
        tokio::task::spawn_blocking(move || store::recover(&data_dir)).await??;
    if report.lost_tail {
        tracing::warn!("journal tail was lost; continuing from last good record");
    }

    let bus = Arc::new(NotificationBus::new(config.bus_capacity));
    let expiry = Arc::new(ExpirySchedule::new());
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    let engine = Arc::new(ConfigEngine::new(
        tree,
        journal,
        validator,
        Arc::clone(&bus),
        Arc::clone(&expiry),
        Arc::clone(&clock),
    ));
    engine.arm_recovered_expiries();

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(run_expiry(
        Arc::clone(&expiry),
        Arc::clone(&engine),
        Arc::clone(&clock),
        shutdown.watch(),
    ));
    tasks.spawn(store::run_compactor(
        Arc::clone(&engine),
        SnapshotStore::new(config.data_dir.join(SNAPSHOT_FILE)),
        config.compaction.clone(),
        shutdown.watch(),
    ));

    if let Some(site) = args.site {
        // Single-box wiring: the queue lives in-process. A cloud
        // deployment swaps StoreChannel for the mTLS transport.
        let store: Arc<dyn CommandStore> = Arc::new(MemoryCommandStore::new(
            Arc::clone(&clock),
            config.queue.lease_window,
            config.queue.max_retries,
        ));
        tasks.spawn(run_lease_reaper(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.queue.reap_interval,
            shutdown.watch(),
        ));
        let reconciler = Reconciler::new(
            Arc::new(StoreChannel::new(store, site)),
            Arc::clone(&engine),
            config.queue.clone(),
        );
        tasks.spawn(reconciler.run(shutdown.watch()));
        tracing::info!(%site, "reconciler enabled");
    }

    let listener = bind_socket(&config.socket_path)?;
    let server = Arc::new(LrpcServer::new(
        Arc::clone(&engine),
        Arc::clone(&bus),
        Arc::clone(&shutdown),
        config.lrpc.clone(),
    ));
    tasks.spawn(Arc::clone(&server).run(listener));

    shutdown.set_serving();
    tracing::info!(
        version = engine.version(),
        socket = %config.socket_path.display(),
        "cfgd serving"
    );

    wait_for_signal().await;
    tracing::info!("shutdown requested");

    shutdown.begin_shutdown();
    if !shutdown.drain(config.drain_timeout).await {
        tracing::warn!(
            in_flight = shutdown.in_flight(),
            "drain timed out; abandoning in-flight requests"
        );
    }
    bus.drain(Duration::from_secs(5)).await;
    shutdown.set_stopped();

    while tasks.join_next().await.is_some() {}
    let _ = std::fs::remove_file(&config.socket_path);
    tracing::info!("cfgd stopped");
    Ok(())
}

/// Registers the daemon's own runtime-tunable settings (timeout
/// overrides in milliseconds).
fn register_own_settings(validator: &Validator) -> anyhow::Result<()> {
    for name in ["send_timeout", "recv_timeout", "open_timeout"] {
        validator
            .register_setting(ValidationRule::new(
                &format!("@/settings/cfgd/{name}"),
                ValueType::Int,
            )?)
            .context("settings registration")?;
    }
    Ok(())
}

/// Binds the RPC socket, replacing a stale file from a previous run.
fn bind_socket(path: &std::path::Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("socket dir {}", parent.display()))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("unlink {}", path.display())),
    }
    UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::error!(error = %err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
