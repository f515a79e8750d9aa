//! Frames received from the radio and commands sent to it.
//!
//! [`Frame`] and [`Command`] are closed enums: every frame type the system
//! understands has its own variant, and anything else arrives as
//! [`Frame::Unknown`]. Both serialize with an `id`/`name` tag matching the
//! radio's frame type names (`zb_rx`, `remote_at`, ...), which is also the
//! first segment of raw-frame routing keys on the broker.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// 16-bit network address meaning "unknown, use the 64-bit address".
pub const UNKNOWN_NETWORK_ADDR: u16 = 0xFFFE;

/// Remote AT option bit: apply the change immediately.
pub const REMOTE_AT_APPLY_CHANGES: u8 = 0x02;

/// A two-character AT command (e.g. `ID`, `D0`, `%V`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtCommand(pub [u8; 2]);

impl AtCommand {
    /// Build a command from a two-character ASCII mnemonic.
    ///
    /// Returns `None` unless `s` is exactly two ASCII characters.
    pub fn new(s: &str) -> Option<Self> {
        match s.as_bytes() {
            [a, b] if a.is_ascii() && b.is_ascii() => {
                Some(AtCommand([a.to_ascii_uppercase(), b.to_ascii_uppercase()]))
            }
            _ => None,
        }
    }
}

impl fmt::Display for AtCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.0[0] as char, self.0[1] as char)
    }
}

/// Delivery status byte from a transmit status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryStatus(pub u8);

impl DeliveryStatus {
    /// Successful delivery.
    pub const SUCCESS: DeliveryStatus = DeliveryStatus(0x00);

    /// Wrap a raw status byte.
    pub const fn from_byte(b: u8) -> Self {
        DeliveryStatus(b)
    }

    /// Whether the radio reported successful delivery.
    pub fn is_success(&self) -> bool {
        self.0 == 0x00
    }

    /// Short human-readable description of the status code.
    pub fn description(&self) -> &'static str {
        match self.0 {
            0x00 => "success",
            0x01 => "MAC ACK failure",
            0x02 => "CCA failure",
            0x15 => "invalid destination endpoint",
            0x21 => "network ACK failure",
            0x22 => "not joined to network",
            0x23 => "self-addressed",
            0x24 => "address not found",
            0x25 => "route not found",
            0x26 => "broadcast relay not heard",
            0x2B => "invalid binding table index",
            0x2C | 0x32 => "resource error",
            0x74 => "payload too large",
            _ => "unknown status",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.0, self.description())
    }
}

/// Status reported in a remote AT command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum RemoteCommandStatus {
    Ok,
    Error,
    InvalidCommand,
    InvalidParameter,
    /// The command never reached the remote node.
    TransmissionFailed,
    Other(u8),
}

impl RemoteCommandStatus {
    /// Whether the remote node accepted the command.
    pub fn is_ok(&self) -> bool {
        matches!(self, RemoteCommandStatus::Ok)
    }
}

impl From<u8> for RemoteCommandStatus {
    fn from(b: u8) -> Self {
        match b {
            0x00 => RemoteCommandStatus::Ok,
            0x01 => RemoteCommandStatus::Error,
            0x02 => RemoteCommandStatus::InvalidCommand,
            0x03 => RemoteCommandStatus::InvalidParameter,
            0x04 => RemoteCommandStatus::TransmissionFailed,
            other => RemoteCommandStatus::Other(other),
        }
    }
}

impl From<RemoteCommandStatus> for u8 {
    fn from(status: RemoteCommandStatus) -> Self {
        match status {
            RemoteCommandStatus::Ok => 0x00,
            RemoteCommandStatus::Error => 0x01,
            RemoteCommandStatus::InvalidCommand => 0x02,
            RemoteCommandStatus::InvalidParameter => 0x03,
            RemoteCommandStatus::TransmissionFailed => 0x04,
            RemoteCommandStatus::Other(b) => b,
        }
    }
}

impl fmt::Display for RemoteCommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCommandStatus::Ok => f.write_str("ok"),
            RemoteCommandStatus::Error => f.write_str("unspecified error"),
            RemoteCommandStatus::InvalidCommand => f.write_str("invalid command"),
            RemoteCommandStatus::InvalidParameter => f.write_str("invalid parameter"),
            RemoteCommandStatus::TransmissionFailed => f.write_str("remote transmission failed"),
            RemoteCommandStatus::Other(b) => write!(f, "status 0x{:02X}", b),
        }
    }
}

/// One analog channel reading from an I/O sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalogReading {
    /// ADC channel number (0-3, or 7 for supply voltage).
    pub channel: u8,
    /// Raw 10-bit ADC value.
    pub value: u16,
}

/// A decoded I/O sample set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IoSample {
    /// Which digital lines are enabled.
    pub digital_mask: u16,
    /// Which analog channels are enabled.
    pub analog_mask: u8,
    /// Digital line states, present when `digital_mask` is non-zero.
    pub digital: Option<u16>,
    /// Analog readings in channel order.
    pub analog: Vec<AnalogReading>,
}

impl IoSample {
    /// Look up the reading for an analog channel.
    pub fn analog(&self, channel: u8) -> Option<u16> {
        self.analog
            .iter()
            .find(|r| r.channel == channel)
            .map(|r| r.value)
    }
}

/// A frame received from the radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum Frame {
    /// Data received from a remote node.
    ZbRx {
        source_addr_long: Address,
        source_addr: u16,
        options: u8,
        rf_data: Vec<u8>,
    },

    /// I/O sample received from a remote node.
    ZbRxIoData {
        source_addr_long: Address,
        source_addr: u16,
        options: u8,
        samples: IoSample,
    },

    /// Outcome of a previous transmit request.
    ZbTxStatus {
        frame_id: u8,
        dest_addr: u16,
        retries: u8,
        delivery_status: DeliveryStatus,
        discovery_status: u8,
    },

    /// Response to a remote AT command.
    RemoteAtResponse {
        frame_id: u8,
        source_addr_long: Address,
        source_addr: u16,
        command: AtCommand,
        status: RemoteCommandStatus,
        parameter: Vec<u8>,
    },

    /// Response to a local AT command.
    AtResponse {
        frame_id: u8,
        command: AtCommand,
        status: u8,
        parameter: Vec<u8>,
    },

    /// Modem status change (reset, joined, ...).
    Status { status: u8 },

    /// A frame type this crate does not decode.
    Unknown { api_id: u8, data: Vec<u8> },
}

impl Frame {
    /// The frame type name, as used in routing keys.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::ZbRx { .. } => "zb_rx",
            Frame::ZbRxIoData { .. } => "zb_rx_io_data",
            Frame::ZbTxStatus { .. } => "zb_tx_status",
            Frame::RemoteAtResponse { .. } => "remote_at_response",
            Frame::AtResponse { .. } => "at_response",
            Frame::Status { .. } => "status",
            Frame::Unknown { .. } => "unknown",
        }
    }

    /// The 64-bit address of the node that sent this frame, if any.
    pub fn source(&self) -> Option<Address> {
        match self {
            Frame::ZbRx { source_addr_long, .. }
            | Frame::ZbRxIoData { source_addr_long, .. }
            | Frame::RemoteAtResponse { source_addr_long, .. } => Some(*source_addr_long),
            _ => None,
        }
    }

    /// The frame id echoed from the originating command, if any.
    pub fn frame_id(&self) -> Option<u8> {
        match self {
            Frame::ZbTxStatus { frame_id, .. }
            | Frame::RemoteAtResponse { frame_id, .. }
            | Frame::AtResponse { frame_id, .. } => Some(*frame_id),
            _ => None,
        }
    }
}

/// A command sent to the radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Command {
    /// Transmit data to a remote node.
    Tx {
        frame_id: u8,
        dest_addr_long: Address,
        dest_addr: u16,
        broadcast_radius: u8,
        options: u8,
        data: Vec<u8>,
    },

    /// Execute an AT command on a remote node.
    RemoteAt {
        frame_id: u8,
        dest_addr_long: Address,
        dest_addr: u16,
        options: u8,
        command: AtCommand,
        parameter: Option<Vec<u8>>,
    },

    /// Execute an AT command on the local radio.
    At {
        frame_id: u8,
        command: AtCommand,
        parameter: Option<Vec<u8>>,
    },
}

impl Command {
    /// A unicast transmit request with default radius and options.
    pub fn transmit(frame_id: u8, dest: Address, data: Vec<u8>) -> Self {
        Command::Tx {
            frame_id,
            dest_addr_long: dest,
            dest_addr: UNKNOWN_NETWORK_ADDR,
            broadcast_radius: 0,
            options: 0,
            data,
        }
    }

    /// A remote AT command that applies changes immediately.
    pub fn remote_at(
        frame_id: u8,
        dest: Address,
        command: AtCommand,
        parameter: Option<Vec<u8>>,
    ) -> Self {
        Command::RemoteAt {
            frame_id,
            dest_addr_long: dest,
            dest_addr: UNKNOWN_NETWORK_ADDR,
            options: REMOTE_AT_APPLY_CHANGES,
            command,
            parameter,
        }
    }

    /// A local AT command.
    pub fn at(frame_id: u8, command: AtCommand, parameter: Option<Vec<u8>>) -> Self {
        Command::At {
            frame_id,
            command,
            parameter,
        }
    }

    /// The command name (`tx`, `remote_at`, `at`).
    pub fn name(&self) -> &'static str {
        match self {
            Command::Tx { .. } => "tx",
            Command::RemoteAt { .. } => "remote_at",
            Command::At { .. } => "at",
        }
    }

    /// The frame id the radio will echo in its response.
    pub fn frame_id(&self) -> u8 {
        match self {
            Command::Tx { frame_id, .. }
            | Command::RemoteAt { frame_id, .. }
            | Command::At { frame_id, .. } => *frame_id,
        }
    }
}
