//! XBee API frame encoder/decoder.
//!
//! XBee modules in API mode (AP=1) exchange binary frames over the serial
//! line. This module handles the pure byte-level encoding of [`Command`]s
//! and decoding of [`Frame`]s. Escaped API mode (AP=2) is not supported.
//!
//! # Frame format
//!
//! ```text
//! 0x7E <len_hi> <len_lo> <api_id> [<data>...] <checksum>
//! ```
//!
//! - Start delimiter: `0x7E`
//! - Length: big-endian count of the bytes from `api_id` through the last
//!   data byte
//! - `checksum`: `0xFF` minus the low byte of the sum of `api_id` and data

use bytes::{BufMut, BytesMut};

use meshlink_core::address::Address;
use meshlink_core::error::{Error, Result};
use meshlink_core::frame::{
    AnalogReading, AtCommand, Command, DeliveryStatus, Frame, IoSample, RemoteCommandStatus,
};

/// Start-of-frame delimiter.
pub const START_DELIMITER: u8 = 0x7E;

/// Largest `api_id` plus data length the 16-bit length field can carry.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// API identifiers for the frame types this crate understands.
pub mod api_id {
    /// Local AT command.
    pub const AT: u8 = 0x08;
    /// ZigBee transmit request.
    pub const TX_REQUEST: u8 = 0x10;
    /// Remote AT command request.
    pub const REMOTE_AT: u8 = 0x17;
    /// Local AT command response.
    pub const AT_RESPONSE: u8 = 0x88;
    /// Modem status.
    pub const MODEM_STATUS: u8 = 0x8A;
    /// ZigBee transmit status.
    pub const TX_STATUS: u8 = 0x8B;
    /// ZigBee receive packet.
    pub const RX: u8 = 0x90;
    /// ZigBee I/O data sample.
    pub const RX_IO_DATA: u8 = 0x92;
    /// Remote AT command response.
    pub const REMOTE_AT_RESPONSE: u8 = 0x97;
}

/// Compute the API checksum over `api_id` and data bytes.
pub fn checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    0xFF - sum
}

/// Wrap an API identifier and data bytes in a complete API frame.
///
/// Returns [`Error::Framing`] if the body does not fit the length field.
///
/// # Example
///
/// ```
/// use meshlink_xbee::api::{encode_api_frame, api_id};
///
/// // Local "AP" query
/// let bytes = encode_api_frame(api_id::AT, &[0x01, b'A', b'P']).unwrap();
/// assert_eq!(bytes, vec![0x7E, 0x00, 0x04, 0x08, 0x01, 0x41, 0x50, 0x65]);
/// ```
pub fn encode_api_frame(api_id: u8, data: &[u8]) -> Result<Vec<u8>> {
    let len = 1 + data.len();
    let announced = u16::try_from(len).map_err(|_| {
        Error::Framing(format!(
            "API frame body of {} bytes exceeds maximum of {}",
            len, MAX_BODY_LEN
        ))
    })?;
    let mut buf = BytesMut::with_capacity(3 + len + 1);
    buf.put_u8(START_DELIMITER);
    buf.put_u16(announced);
    buf.put_u8(api_id);
    buf.put_slice(data);

    let sum = data.iter().fold(api_id, |acc, &b| acc.wrapping_add(b));
    buf.put_u8(0xFF - sum);
    Ok(buf.to_vec())
}

/// Encode a [`Command`] into a complete API frame.
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    let mut data = BytesMut::new();
    let id = match command {
        Command::Tx {
            frame_id,
            dest_addr_long,
            dest_addr,
            broadcast_radius,
            options,
            data: payload,
        } => {
            data.put_u8(*frame_id);
            data.put_slice(dest_addr_long.as_bytes());
            data.put_u16(*dest_addr);
            data.put_u8(*broadcast_radius);
            data.put_u8(*options);
            data.put_slice(payload);
            api_id::TX_REQUEST
        }
        Command::RemoteAt {
            frame_id,
            dest_addr_long,
            dest_addr,
            options,
            command,
            parameter,
        } => {
            data.put_u8(*frame_id);
            data.put_slice(dest_addr_long.as_bytes());
            data.put_u16(*dest_addr);
            data.put_u8(*options);
            data.put_slice(&command.0);
            if let Some(param) = parameter {
                data.put_slice(param);
            }
            api_id::REMOTE_AT
        }
        Command::At {
            frame_id,
            command,
            parameter,
        } => {
            data.put_u8(*frame_id);
            data.put_slice(&command.0);
            if let Some(param) = parameter {
                data.put_slice(param);
            }
            api_id::AT
        }
    };
    encode_api_frame(id, &data)
}

/// Result of attempting to decode a frame from a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete frame was decoded. The `usize` is the number of bytes
    /// consumed from the input buffer.
    Frame(Frame, usize),

    /// The buffer does not yet contain a complete frame.
    Incomplete,

    /// The buffer starts with bytes that cannot begin a valid frame (noise,
    /// or a frame with a bad checksum). Discard this many bytes and retry.
    Invalid(usize),
}

/// Attempt to decode one API frame from the front of a byte buffer.
///
/// Bytes before the first start delimiter are reported as
/// [`DecodeResult::Invalid`] so the caller can drop them. A frame whose
/// checksum does not match consumes only its start delimiter, letting the
/// decoder resynchronize on the next `0x7E`.
///
/// # Example
///
/// ```
/// use meshlink_xbee::api::{decode_frame, DecodeResult};
/// use meshlink_core::Frame;
///
/// // Modem status: coordinator started
/// let buf = [0x7E, 0x00, 0x02, 0x8A, 0x06, 0x6F];
/// match decode_frame(&buf) {
///     DecodeResult::Frame(Frame::Status { status }, consumed) => {
///         assert_eq!(status, 6);
///         assert_eq!(consumed, 6);
///     }
///     other => panic!("expected a frame, got {:?}", other),
/// }
/// ```
pub fn decode_frame(buf: &[u8]) -> DecodeResult {
    let start = match buf.iter().position(|&b| b == START_DELIMITER) {
        Some(0) => 0,
        Some(pos) => return DecodeResult::Invalid(pos),
        None if buf.is_empty() => return DecodeResult::Incomplete,
        None => return DecodeResult::Invalid(buf.len()),
    };

    if buf.len() < start + 3 {
        return DecodeResult::Incomplete;
    }

    let len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if len == 0 {
        return DecodeResult::Invalid(1);
    }

    let total = 3 + len + 1;
    if buf.len() < total {
        return DecodeResult::Incomplete;
    }

    let body = &buf[3..3 + len];
    if checksum(body) != buf[3 + len] {
        return DecodeResult::Invalid(1);
    }

    DecodeResult::Frame(parse_body(body[0], &body[1..]), total)
}

/// Decode the data portion of a frame according to its API identifier.
///
/// Frames too short for their declared type come back as
/// [`Frame::Unknown`] rather than being dropped.
fn parse_body(id: u8, data: &[u8]) -> Frame {
    let parsed = match id {
        api_id::RX => parse_rx(data),
        api_id::RX_IO_DATA => parse_rx_io(data),
        api_id::TX_STATUS => parse_tx_status(data),
        api_id::REMOTE_AT_RESPONSE => parse_remote_at_response(data),
        api_id::AT_RESPONSE => parse_at_response(data),
        api_id::MODEM_STATUS => data.first().map(|&status| Frame::Status { status }),
        _ => None,
    };

    parsed.unwrap_or_else(|| Frame::Unknown {
        api_id: id,
        data: data.to_vec(),
    })
}

fn read_address(data: &[u8]) -> Option<Address> {
    let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
    Some(Address::new(bytes))
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(at)?, *data.get(at + 1)?]))
}

fn read_command(data: &[u8], at: usize) -> Option<AtCommand> {
    Some(AtCommand([*data.get(at)?, *data.get(at + 1)?]))
}

fn parse_rx(data: &[u8]) -> Option<Frame> {
    if data.len() < 11 {
        return None;
    }
    Some(Frame::ZbRx {
        source_addr_long: read_address(data)?,
        source_addr: read_u16(data, 8)?,
        options: data[10],
        rf_data: data[11..].to_vec(),
    })
}

fn parse_rx_io(data: &[u8]) -> Option<Frame> {
    // 64-bit source, 16-bit source, options, sample count, masks
    if data.len() < 15 {
        return None;
    }
    let digital_mask = read_u16(data, 12)?;
    let analog_mask = data[14];
    let mut at = 15;

    let digital = if digital_mask != 0 {
        let value = read_u16(data, at)?;
        at += 2;
        Some(value)
    } else {
        None
    };

    let mut analog = Vec::new();
    for channel in 0..8u8 {
        if analog_mask & (1 << channel) != 0 {
            analog.push(AnalogReading {
                channel,
                value: read_u16(data, at)?,
            });
            at += 2;
        }
    }

    Some(Frame::ZbRxIoData {
        source_addr_long: read_address(data)?,
        source_addr: read_u16(data, 8)?,
        options: data[10],
        samples: IoSample {
            digital_mask,
            analog_mask,
            digital,
            analog,
        },
    })
}

fn parse_tx_status(data: &[u8]) -> Option<Frame> {
    if data.len() < 6 {
        return None;
    }
    Some(Frame::ZbTxStatus {
        frame_id: data[0],
        dest_addr: read_u16(data, 1)?,
        retries: data[3],
        delivery_status: DeliveryStatus::from_byte(data[4]),
        discovery_status: data[5],
    })
}

fn parse_remote_at_response(data: &[u8]) -> Option<Frame> {
    if data.len() < 14 {
        return None;
    }
    Some(Frame::RemoteAtResponse {
        frame_id: data[0],
        source_addr_long: read_address(&data[1..])?,
        source_addr: read_u16(data, 9)?,
        command: read_command(data, 11)?,
        status: RemoteCommandStatus::from(data[13]),
        parameter: data[14..].to_vec(),
    })
}

fn parse_at_response(data: &[u8]) -> Option<Frame> {
    if data.len() < 4 {
        return None;
    }
    Some(Frame::AtResponse {
        frame_id: data[0],
        command: read_command(data, 1)?,
        status: data[3],
        parameter: data[4..].to_vec(),
    })
}
