//! Transmit RPC message bodies.

use serde::{Deserialize, Serialize};

use meshlink_core::address::Address;

/// A request published to the transmit queue.
///
/// Serializes as `{"method": "send_data", "dest": "...", "data": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TransmitRequest {
    /// Transmit `data` to the node at `dest` and report the delivery status.
    SendData { dest: Address, data: Vec<u8> },
}

impl TransmitRequest {
    /// Build a `send_data` request.
    pub fn send_data(dest: Address, data: impl Into<Vec<u8>>) -> Self {
        TransmitRequest::SendData {
            dest,
            data: data.into(),
        }
    }
}
