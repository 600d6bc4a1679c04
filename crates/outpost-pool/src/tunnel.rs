use async_trait::async_trait;
use outpost_common::Endpoint;

/// Configures the live data path. Called once per committed switch with the
/// endpoint that just became active.
#[async_trait]
pub trait TunnelConfigurator: Send + Sync {
    async fn apply_active_endpoint(&self, endpoint: &Endpoint) -> anyhow::Result<()>;
}
