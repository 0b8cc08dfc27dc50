//! DeferredResource controller errors

use integration_common::Error;

/// Errors raised while reconciling a DeferredResource
#[derive(Debug, thiserror::Error)]
pub enum DeferredError {
    /// Error from the shared operator layer
    #[error("{0}")]
    Common(#[from] Error),

    /// DeferredResource arrived without a namespace
    #[error("missing namespace on DeferredResource '{0}'")]
    MissingNamespace(String),
}

impl DeferredError {
    /// Whether this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_conflict())
    }

    /// Whether a required property was missing
    pub fn is_missing_required(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_missing_required())
    }

    /// Whether retrying without a spec change can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Common(e) => e.is_retryable(),
            Self::MissingNamespace(_) => false,
        }
    }
}

impl From<kube::Error> for DeferredError {
    fn from(err: kube::Error) -> Self {
        Self::Common(err.into())
    }
}
