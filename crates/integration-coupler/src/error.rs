//! Coupler-specific error types

use integration_common::Error;

/// Errors raised while reconciling plugs and sockets
#[derive(Debug, thiserror::Error)]
pub enum CouplerError {
    /// Error from the shared operator layer
    #[error("{0}")]
    Common(#[from] Error),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Namespaced object arrived without a namespace
    #[error("missing namespace on {kind} '{name}'")]
    MissingNamespace {
        /// Kind of the object
        kind: &'static str,
        /// Name of the object
        name: String,
    },
}

impl CouplerError {
    /// Whether this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Common(e) => e.is_conflict(),
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Whether this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Common(e) => e.is_not_found(),
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Whether retrying without a spec change can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Common(e) => e.is_retryable(),
            Self::Kube(kube::Error::Api(ae)) => !(400..500).contains(&ae.code) || ae.code == 409,
            Self::Kube(_) => true,
            Self::Serialization(_) | Self::MissingNamespace { .. } => false,
        }
    }
}
