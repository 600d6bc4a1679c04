mod args;
mod handlers;
mod metrics;
mod state;
mod xray;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use outpost_common::Endpoint;
use outpost_pool::{snapshot, FileSnapshotStore, NetProbe, Pool, PoolConfig, Registry, SnapshotStore};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::args::Args;
use crate::state::AppState;
use crate::xray::XrayConfigWriter;

async fn load_endpoints(path: &Path) -> anyhow::Result<Vec<Endpoint>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "endpoints file not found");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn same_target(a: &Endpoint, b: &Endpoint) -> bool {
    a.protocol == b.protocol
        && a.address == b.address
        && a.port == b.port
        && a.params == b.params
        && a.base_weight == b.base_weight
}

/// Add configured endpoints, keeping restored health state for the ones whose
/// connection settings did not change.
fn merge_configured(registry: &Registry, configured: Vec<Endpoint>) {
    let fresh: Vec<Endpoint> = configured
        .into_iter()
        .filter(|ep| {
            registry
                .get(&ep.id)
                .map_or(true, |known| !same_target(&known, ep))
        })
        .collect();
    let offered = fresh.len();
    let rejected = registry.add_all(fresh);
    for e in &rejected {
        tracing::warn!(error = %e, "endpoint rejected");
    }
    tracing::info!(
        added = offered - rejected.len(),
        rejected = rejected.len(),
        total = registry.len(),
        "endpoints loaded"
    );
}

async fn save_snapshot(pool: &Pool, store: Option<&Arc<dyn SnapshotStore>>) {
    if let Some(store) = store {
        if let Err(e) = snapshot::persist(&pool.registry, store.as_ref()).await {
            tracing::warn!(error = %e, "snapshot save failed");
        }
    }
}

async fn rebalance_loop(
    pool: Pool,
    store: Option<Arc<dyn SnapshotStore>>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if pool.failover.active().is_none() {
            match pool.failover.bootstrap().await {
                Ok(ep) => tracing::info!(endpoint_id = %ep.id, "active endpoint acquired"),
                Err(e) => tracing::warn!(error = %e, "still no usable endpoint"),
            }
        } else if !pool.failover.switch_to_optimal().await {
            tracing::debug!("rebalance skipped");
        }
        save_snapshot(&pool, store.as_ref()).await;
    }
}

async fn log_events(pool: Pool) {
    let mut events = BroadcastStream::new(pool.failover.subscribe());
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => tracing::info!(?event, "failover event"),
            Err(e) => tracing::warn!(error = %e, "failover event stream lagged"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_provider = outpost_common::telemetry::init_tracing(
        "outpost-agent",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let mut config = PoolConfig::from_env();
    config.strategy = args.strategy;

    let transport = Arc::new(NetProbe::new(config.bridge_socks_addr.clone()));
    let tunnel = Arc::new(XrayConfigWriter::new(&args.tunnel_config_path));
    tracing::info!(path = %tunnel.path().display(), strategy = %config.strategy, "tunnel config target");
    let pool = Pool::new(&config, transport, tunnel)?;

    let store: Option<Arc<dyn SnapshotStore>> = args
        .snapshot_path
        .as_ref()
        .map(|p| Arc::new(FileSnapshotStore::new(p)) as Arc<dyn SnapshotStore>);
    if let Some(store) = &store {
        if let Err(e) = snapshot::restore(&pool.registry, store.as_ref()).await {
            tracing::warn!(error = %e, "snapshot restore failed, starting cold");
        }
    }
    merge_configured(&pool.registry, load_endpoints(&args.endpoints_file).await?);

    match pool.failover.bootstrap().await {
        Ok(ep) => tracing::info!(endpoint_id = %ep.id, name = %ep.display_name, "initial endpoint active"),
        Err(e) => tracing::warn!(error = %e, "no initial endpoint, retrying on rebalance"),
    }

    let shutdown = CancellationToken::new();
    let prober_task = pool.start_health_checks();
    tokio::spawn(log_events(pool.clone()));
    let rebalance_task = tokio::spawn(rebalance_loop(
        pool.clone(),
        store.clone(),
        Duration::from_secs(args.rebalance_interval_secs.max(1)),
        shutdown.clone(),
    ));

    let st = AppState {
        pool: pool.clone(),
        snapshot: store.clone(),
        metrics: Arc::new(metrics::Metrics::default()),
    };

    let app = handlers::router(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("binding {}", args.listen_addr))?;
    tracing::info!(addr = %args.listen_addr, "control surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    pool.shutdown().await;
    if let Err(e) = prober_task.await {
        tracing::warn!(error = %e, "health prober task failed");
    }
    if let Err(e) = rebalance_task.await {
        tracing::warn!(error = %e, "rebalance task failed");
    }
    save_snapshot(&pool, store.as_ref()).await;

    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("otel shutdown error: {e}");
        }
    }
    Ok(())
}
