//! Environment configuration for the operator
//!
//! Trait-based so controllers can be tested without touching process env.

use crate::DEFAULT_OPERATOR_NAMESPACE;

/// Default number of reconciles run concurrently per controller
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 3;

/// Trait for reading operator settings from the environment
#[cfg_attr(test, mockall::automock)]
pub trait OperatorEnv: Send + Sync {
    /// Raw `MAX_CONCURRENT_RECONCILES` value
    fn max_concurrent_reconciles_raw(&self) -> Option<String>;

    /// Raw `POD_NAMESPACE` value
    fn pod_namespace_raw(&self) -> Option<String>;
}

/// Concurrency limit for each controller; invalid or zero values fall back to the default
pub fn max_concurrent_reconciles(env: &dyn OperatorEnv) -> u16 {
    env.max_concurrent_reconciles_raw()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENT_RECONCILES)
}

/// Namespace the operator runs in, used as the default Interface namespace
pub fn pod_namespace(env: &dyn OperatorEnv) -> String {
    env.pod_namespace_raw()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_OPERATOR_NAMESPACE.to_string())
}

/// Default implementation that reads from environment variables
#[derive(Clone, Default)]
pub struct OsEnv;

impl OperatorEnv for OsEnv {
    fn max_concurrent_reconciles_raw(&self) -> Option<String> {
        std::env::var("MAX_CONCURRENT_RECONCILES").ok()
    }

    fn pod_namespace_raw(&self) -> Option<String> {
        std::env::var("POD_NAMESPACE").ok()
    }
}
