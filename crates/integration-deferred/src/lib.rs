//! DeferredResource controller
//!
//! Holds a manifest back until its timeout has elapsed and every object it
//! waits for exists, then applies it and records the applied object.

#![deny(missing_docs)]

pub mod controller;
pub mod error;

pub use controller::{error_policy, reconcile, Context};
pub use error::DeferredError;
