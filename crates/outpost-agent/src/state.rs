use std::sync::Arc;

use outpost_pool::{Pool, SnapshotStore};

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub snapshot: Option<Arc<dyn SnapshotStore>>,
    pub metrics: Arc<Metrics>,
}
