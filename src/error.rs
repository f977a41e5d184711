//! Error kinds for the gateway synchronization engine.
//!
//! Propagation policy (see design notes): `HubConnectionLost` and
//! `LocalAdapterError` are recovered internally by the watcher's
//! re-convergence and never escape to an operator command. Only
//! connect-time and command-time validation errors are returned to callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("lost connection to hub")]
    HubConnectionLost,

    #[error("no hub listening at {ip}:{port}")]
    HubNotFound { ip: String, port: u16 },

    #[error("no hub registered under name '{name}'")]
    HubNameNotFound { name: String },

    #[error("remote gateway '{gateway}' is not available on any connected hub")]
    GatewayUnavailable { gateway: String },

    #[error("unknown connection type '{found}'")]
    ConnectionTypeError { found: String },

    #[error("local adapter error: {detail}")]
    LocalAdapterError { detail: String },
}

pub type GatewayResult<T> = Result<T, GatewayError>;
