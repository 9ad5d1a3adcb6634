//! Foundational system components for strata's services.
//!
//! Every pipeline stage is a [`Service`]: it owns its state, receives messages through a bounded
//! [`channel`] and exits when its [`ShutdownHandle`] fires.
#![warn(missing_docs)]

mod controller;
mod service;
mod statsd;
mod status;

pub use self::controller::*;
pub use self::service::*;
pub use self::status::*;
