//! Configuration module
//!
//! Relay settings loaded from an optional TOML file and overridden from the
//! command line.

mod relay;

pub use relay::*;
