//! Configuration for the strata receiver.
//!
//! The configuration is loaded from a `config.yml` in a configuration folder. Every section and
//! every value is optional and falls back to its default. Individual values can be overridden
//! afterwards, for example from command line arguments, using [`OverridableConfig`].
#![warn(missing_docs)]

mod config;

pub use self::config::*;
