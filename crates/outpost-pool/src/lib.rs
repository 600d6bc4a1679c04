use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod failover;
pub mod prober;
pub mod registry;
pub mod selector;
pub mod snapshot;
pub mod strategy;
pub mod transport;
pub mod tunnel;

pub use config::PoolConfig;
pub use failover::{FailoverController, FailoverEvent, FailoverState, FailoverStats, FailureReport};
pub use prober::{CycleReport, HealthProber};
pub use registry::{Registry, RegistryStats};
pub use selector::Selector;
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use strategy::{SelectionStrategy, StrategyKind};
pub use transport::{NetProbe, ProbeTransport};
pub use tunnel::TunnelConfigurator;

/// The four components wired together over shared state.
#[derive(Debug, Clone)]
pub struct Pool {
    pub registry: Arc<Registry>,
    pub selector: Arc<Selector>,
    pub prober: Arc<HealthProber>,
    pub failover: Arc<FailoverController>,
    shutdown: CancellationToken,
}

impl Pool {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &PoolConfig,
        transport: Arc<dyn ProbeTransport>,
        tunnel: Arc<dyn TunnelConfigurator>,
    ) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("pool must be created inside a tokio runtime")?;
        let registry = Registry::with_config(config);
        let selector = Selector::new();
        let prober = HealthProber::new(config, registry.clone(), selector.clone(), transport);
        let failover = FailoverController::new(
            config,
            registry.clone(),
            selector.clone(),
            prober.clone(),
            tunnel,
            runtime,
        );
        Ok(Self {
            registry,
            selector,
            prober,
            failover,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn start_health_checks(&self) -> JoinHandle<()> {
        self.prober.spawn(self.shutdown.child_token())
    }

    /// Cancel the health cycle immediately, then let a running switch finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.failover.shutdown().await;
    }
}
