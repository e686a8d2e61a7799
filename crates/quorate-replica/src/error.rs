//! Error types for the replica integration shim.

use thiserror::Error;

/// Errors that can occur while wiring up or running a [`crate::runtime::ReplicaRuntime`].
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Configuration could not be loaded or deserialized.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Binding the network listener failed.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    /// I/O error on the receive/dispatch path.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The coordinator rejected a message at ingress.
    #[error("pre-processor rejected message: {0}")]
    PreProcessor(#[from] quorate_core::PreProcessorError),
}
