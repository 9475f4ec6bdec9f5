//! Controller-specific error types.
//!
//! Failures while starting or serving the webhook. Per-event failures never
//! surface here; they are folded into a `ReconciliationOutcome`.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the provision webhook.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Listener or server I/O error
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
