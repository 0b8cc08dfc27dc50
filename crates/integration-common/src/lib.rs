//! Common types for the integration operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod resource;
pub mod retry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "integration-operator";

/// Finalizer placed on plugs, sockets and deferred resources
pub const FINALIZER: &str = "integration.rock8s.com/finalizer";

/// Namespace assumed for the operator when `POD_NAMESPACE` is unset
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "kube-system";
