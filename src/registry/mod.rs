//! Connection registry module
//!
//! Tracks every open connection and the user identifiers bound to them.

#[allow(dead_code)]
mod connection;
#[allow(dead_code)]
mod store;

pub use connection::*;
pub use store::*;
