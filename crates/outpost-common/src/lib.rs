pub mod endpoint;
pub mod error;
pub mod health;
pub mod util;

pub use endpoint::{smooth_latency, Endpoint, ProtocolKind, DEFAULT_BASE_WEIGHT};
pub use error::{ConfigError, PoolError};
pub use health::HealthResult;
pub use util::now_ms;

pub mod telemetry;
