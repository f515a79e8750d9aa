//! # meshlink -- XBee radio meshes over TCP and AMQP
//!
//! `meshlink` shares one XBee radio (in API mode) between many processes.
//! A gateway owns the serial port and multiplexes it over TCP; a bridge
//! turns the gateway's frames into broker messages; worker processes
//! consume frames for the nodes they care about and send data back with
//! delivery confirmation.
//!
//! ```text
//!  XBee ──serial── Gateway ══TCP══ Bridge ──AMQP── Consumer(s)
//! ```
//!
//! ## Quick Start
//!
//! Receive frames from two nodes and reply to each one:
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use meshlink::bus::{AmqpBus, PacketConsumer, PacketHandler};
//! use meshlink::{Address, Frame};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl PacketHandler for Echo {
//!     async fn handle_packet(
//!         &self,
//!         consumer: &PacketConsumer,
//!         address: Address,
//!         frame: Frame,
//!     ) -> anyhow::Result<()> {
//!         if let Frame::ZbRx { rf_data, .. } = frame {
//!             consumer.send_data_and_confirm(address, rf_data).await?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bus = Arc::new(AmqpBus::connect("amqp://localhost").await?);
//!     let consumer = PacketConsumer::builder()
//!         .address("00:13:a2:00:40:32:dc:dc".parse()?)
//!         .handler(Echo)
//!         .build(bus)
//!         .await?;
//!     consumer.closed().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                   | Purpose                                          |
//! |-------------------------|--------------------------------------------------|
//! | `meshlink-core`         | [`Frame`], [`Command`], [`Address`], [`RadioLink`], errors |
//! | `meshlink-xbee`         | API mode 1 codec and serial radio link           |
//! | `meshlink-gateway`      | TCP gateway server, session loop, client         |
//! | `meshlink-bus`          | Broker abstraction, packet bridge and consumer   |
//! | **`meshlink`**          | This facade crate -- re-exports everything       |
//!
//! ## Feature Flags
//!
//! | Feature   | Enables                              | Default |
//! |-----------|--------------------------------------|---------|
//! | `xbee`    | [`xbee`] module (serial driver)      | yes     |
//! | `gateway` | [`gateway`] module (TCP multiplexer) | yes     |
//! | `bus`     | [`bus`] module (AMQP bridge/consumer)| yes     |
//! | `full`    | All of the above                     | no      |

pub use meshlink_core::*;

/// XBee API mode 1 codec and serial radio link.
///
/// Provides [`XBeeLink`](xbee::XBeeLink), the [`RadioLink`] that owns a
/// serial port, and [`SerialConfig`](xbee::SerialConfig).
#[cfg(feature = "xbee")]
pub mod xbee {
    pub use meshlink_xbee::*;
}

/// TCP gateway sharing one radio among many clients.
///
/// Provides [`Gateway`](gateway::Gateway) and
/// [`GatewayClient`](gateway::GatewayClient), which speak
/// `[u32 BE length][JSON]` frames to each other.
#[cfg(feature = "gateway")]
pub mod gateway {
    pub use meshlink_gateway::*;
}

/// Message broker plumbing.
///
/// Provides [`PacketBridge`](bus::PacketBridge),
/// [`PacketConsumer`](bus::PacketConsumer), and the
/// [`MessageBus`](bus::MessageBus) implementations.
#[cfg(feature = "bus")]
pub mod bus {
    pub use meshlink_bus::*;
}
