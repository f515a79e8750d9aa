//! Error types for meshlink.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Radio link failures, wire framing
//! problems, broker failures, and confirmation outcomes reported by the radio
//! are all captured here.

use crate::address::Address;
use crate::frame::{DeliveryStatus, RemoteCommandStatus};

/// The error type for all meshlink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port, TCP socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// A length-prefixed wire header was short, garbled, or oversized.
    #[error("framing error: {0}")]
    Framing(String),

    /// A payload could not be serialized or deserialized.
    #[error("codec error: {0}")]
    Codec(String),

    /// A message broker operation failed.
    #[error("message bus error: {0}")]
    Bus(String),

    /// No confirmation arrived within the RPC window.
    #[error("timeout waiting for confirmation")]
    Timeout,

    /// The destination address is not one this consumer subscribes to.
    ///
    /// Raised before any I/O is performed.
    #[error("destination address {0} is not configured for this consumer")]
    InvalidDestination(Address),

    /// The radio reported that a data transmission was not delivered.
    #[error("delivery failed with status {status} after {retries} retries")]
    DeliveryFailed {
        /// Delivery status reported by the radio.
        status: DeliveryStatus,
        /// Number of retries the radio performed.
        retries: u8,
    },

    /// The remote node rejected or never received a configuration command.
    #[error("remote command failed: {0}")]
    RemoteCommand(RemoteCommandStatus),

    /// The peer closed the connection. Not a failure in itself.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// No connection has been established, or it was shut down.
    #[error("not connected")]
    NotConnected,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
