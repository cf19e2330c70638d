//! WebSocket relay server module
//!
//! Accepts connections, negotiates the upgrade and relays text frames
//! between clients.

mod handshake;
mod params;
#[allow(dead_code)]
mod protocol;
#[allow(dead_code)]
mod router;
mod session;
mod websocket;

#[allow(unused_imports)]
pub use handshake::*;
#[allow(unused_imports)]
pub use params::*;
pub use protocol::*;
#[allow(unused_imports)]
pub use router::*;
#[allow(unused_imports)]
pub use session::*;
pub use websocket::*;
