//! Integration operator: couples Plugs to Sockets and applies DeferredResources

#![deny(missing_docs)]

/// Builds the controller futures the binary runs
pub mod controller_runner;
/// Startup utilities (CRD install)
pub mod startup;
