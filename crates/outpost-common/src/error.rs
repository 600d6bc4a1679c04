use thiserror::Error;

use crate::endpoint::ProtocolKind;

/// Malformed endpoint configuration. An endpoint carrying one of these is never
/// admitted into the pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("endpoint id must not be empty")]
    EmptyId,
    #[error("endpoint {id}: address must not be empty")]
    EmptyAddress { id: String },
    #[error("endpoint {id}: port must be non-zero")]
    ZeroPort { id: String },
    #[error("endpoint {id}: base weight {weight} outside 1..=200")]
    BaseWeight { id: String, weight: u32 },
    #[error("endpoint {id}: {protocol} requires parameter `{field}`")]
    MissingParam {
        id: String,
        protocol: ProtocolKind,
        field: &'static str,
    },
    #[error("endpoint {id}: invalid parameter `{field}`: {reason}")]
    InvalidParam {
        id: String,
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Connect failure or timeout towards the endpoint itself.
    #[error("transport error on {endpoint_id}: {message}")]
    Transport { endpoint_id: String, message: String },
    /// The endpoint accepted a connection but did not forward a canary request.
    #[error("probe failed on {endpoint_id}: {message}")]
    Probe { endpoint_id: String, message: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no healthy endpoint available: {0}")]
    Exhaustion(String),
    #[error("failed to apply endpoint {endpoint_id}: {message}")]
    Commit { endpoint_id: String, message: String },
    #[error("a switch is already in progress")]
    SwitchInProgress,
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(String),
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl PoolError {
    pub fn transport(endpoint_id: &str, message: impl ToString) -> Self {
        PoolError::Transport {
            endpoint_id: endpoint_id.to_string(),
            message: message.to_string(),
        }
    }

    pub fn probe(endpoint_id: &str, message: impl ToString) -> Self {
        PoolError::Probe {
            endpoint_id: endpoint_id.to_string(),
            message: message.to_string(),
        }
    }
}
