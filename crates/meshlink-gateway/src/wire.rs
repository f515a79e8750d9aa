//! Length-prefixed wire codec for the gateway TCP protocol.
//!
//! Every message in either direction is framed as:
//!
//! ```text
//! [u32 BE length] [payload: length bytes]
//! ```
//!
//! The payload is the JSON form of a [`Command`](meshlink_core::Command)
//! (client to gateway) or a [`Frame`](meshlink_core::Frame) (gateway to
//! client). There are no other boundary markers.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use meshlink_core::error::{Error, Result};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum payload size (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Encode a message as `[u32 BE length][JSON payload]`.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message).map_err(|e| Error::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::Framing(format!(
            "payload of {} bytes exceeds maximum of {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a JSON payload (without its header).
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::Codec(e.to_string()))
}

/// Parse a length header, rejecting oversize lengths.
pub fn parse_header(header: [u8; HEADER_LEN]) -> Result<u32> {
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(Error::Framing(format!(
            "header announces {} bytes, maximum is {}",
            len, MAX_FRAME_SIZE
        )));
    }
    Ok(len)
}

/// Outcome of a bounded attempt to read a length header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderRead {
    /// The peer closed the connection.
    Closed,
    /// No bytes arrived within the wait.
    Idle,
    /// Fewer than [`HEADER_LEN`] bytes arrived within the wait. The bytes are
    /// discarded.
    Short(Vec<u8>),
    /// A complete header announcing a payload of this many bytes.
    Complete(u32),
}

/// Read one length header, waiting at most `wait` for it to arrive.
///
/// Returns [`Error::Framing`] if the header announces more than
/// [`MAX_FRAME_SIZE`] bytes; the stream cannot be resynchronized after that.
pub async fn read_header<R>(reader: &mut R, wait: Duration) -> Result<HeaderRead>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;

    let outcome = tokio::time::timeout(wait, async {
        while filled < HEADER_LEN {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                return Ok::<bool, std::io::Error>(false);
            }
            filled += n;
        }
        Ok(true)
    })
    .await;

    match outcome {
        Ok(Ok(true)) => parse_header(header).map(HeaderRead::Complete),
        Ok(Ok(false)) => Ok(HeaderRead::Closed),
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) if filled == 0 => Ok(HeaderRead::Idle),
        Err(_) => Ok(HeaderRead::Short(header[..filled].to_vec())),
    }
}

/// Read exactly `len` payload bytes.
///
/// Returns [`Error::ConnectionClosed`] if the stream ends mid-payload.
pub async fn read_payload<R>(reader: &mut R, len: u32) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(payload),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Read exactly `len` payload bytes, giving up after `wait`.
///
/// A payload that does not arrive in full is a [`Error::Framing`] error:
/// part of it has been consumed, so the stream cannot be resynchronized.
pub async fn read_payload_within<R>(reader: &mut R, len: u32, wait: Duration) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(wait, read_payload(reader, len)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Framing(format!(
            "payload of {} bytes not received within {:?}",
            len, wait
        ))),
    }
}

/// Read one complete message, waiting as long as it takes.
///
/// Returns `Ok(None)` if the stream ends cleanly at a message boundary.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let len = parse_header(header)?;
    let payload = read_payload(reader, len).await?;
    decode(&payload).map(Some)
}

/// Encode and write one message in full.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
