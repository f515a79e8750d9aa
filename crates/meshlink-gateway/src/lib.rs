//! TCP gateway that shares one radio among many network clients.
//!
//! - [`Gateway`]: owns the radio link, accepts connections, fans inbound
//!   frames out to every client and serializes outbound commands
//! - [`ClientSession`]: the per-connection duplex loop
//! - [`GatewayClient`]: the client end of the protocol, usable as a
//!   [`RadioLink`](meshlink_core::RadioLink)
//! - [`wire`]: the `[u32 BE length][JSON]` framing shared by both ends

pub mod client;
pub mod server;
pub mod session;
pub mod wire;

pub use client::GatewayClient;
pub use server::{ActiveClients, Gateway, GatewayConfig, SessionId, DEFAULT_PORT};
pub use session::{ClientSession, SessionConfig};
