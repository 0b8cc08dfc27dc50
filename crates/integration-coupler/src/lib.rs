//! Plug/Socket coupling engine
//!
//! A plug couples to a socket by exchanging resolved config and results and
//! running lifecycle handlers on both sides. Lifecycle events flow through an
//! in-process [`bus::EventBus`]; advisory events are run in the background by
//! the [`dispatcher::Dispatcher`].

#![deny(missing_docs)]

pub mod apparatus;
pub mod bus;
pub mod client;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod locks;
pub mod resolver;

pub use controller::{error_policy, reconcile_plug, reconcile_socket, Context};
pub use error::CouplerError;
