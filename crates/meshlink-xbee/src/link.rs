//! XBee radio link driver.
//!
//! [`XBeeLink`] owns the byte stream to a locally attached XBee module. It
//! spawns one background task that reads the stream, decodes API frames, and
//! hands each [`Frame`] to the callback supplied at open time. Commands are
//! encoded and written by [`RadioLink::send`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use meshlink_core::error::{Error, Result};
use meshlink_core::frame::Command;
use meshlink_core::link::{FrameCallback, RadioLink};

use crate::api::{self, DecodeResult};
use crate::serial::{open_serial_stream, SerialConfig};

/// Read buffer size for the receive task.
const READ_CHUNK: usize = 512;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A link to an XBee module in API mode.
///
/// The link is safe to share across tasks; sends are serialized on an
/// internal writer lock, so one command's bytes are always contiguous.
pub struct XBeeLink {
    writer: Mutex<Option<BoxedWriter>>,
    rx_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl XBeeLink {
    /// Start a link over an already-open byte stream.
    ///
    /// `on_frame` is called from the link's receive task for every decoded
    /// frame. The task ends when the stream reaches EOF, a read fails, or
    /// [`halt`](RadioLink::halt) is called.
    pub fn open<S>(stream: S, on_frame: FrameCallback) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(true));

        let rx_handle = {
            let cancel = cancel.clone();
            let connected = Arc::clone(&connected);
            tokio::spawn(async move {
                rx_loop(reader, on_frame, cancel, connected).await;
            })
        };

        let writer: BoxedWriter = Box::new(writer);
        XBeeLink {
            writer: Mutex::new(Some(writer)),
            rx_handle: std::sync::Mutex::new(Some(rx_handle)),
            cancel,
            connected,
        }
    }

    /// Open a serial port and start a link over it.
    pub fn open_serial(port: &str, config: &SerialConfig, on_frame: FrameCallback) -> Result<Self> {
        let stream = open_serial_stream(port, config)?;
        Ok(Self::open(stream, on_frame))
    }
}

#[async_trait]
impl RadioLink for XBeeLink {
    async fn send(&self, command: &Command) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        let bytes = api::encode_command(command).map_err(|e| {
            tracing::error!(command = command.name(), error = %e, "Cannot encode command");
            e
        })?;
        tracing::trace!(
            command = command.name(),
            frame_id = command.frame_id(),
            bytes = bytes.len(),
            "Sending API frame"
        );

        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(Error::NotConnected)?;
        w.write_all(&bytes).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to write to radio");
            Error::Transport(format!("failed to write to radio: {}", e))
        })?;
        w.flush()
            .await
            .map_err(|e| Error::Transport(format!("failed to flush radio stream: {}", e)))?;
        Ok(())
    }

    async fn halt(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        let handle = self
            .rx_handle
            .lock()
            .map_err(|_| Error::Transport("receive task handle poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            if let Err(e) = w.shutdown().await {
                tracing::debug!(error = %e, "Error closing radio stream");
            }
            tracing::info!("Radio link halted");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for XBeeLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------

/// Background task that reads the radio stream and decodes API frames.
async fn rx_loop<R>(
    mut reader: ReadHalf<R>,
    on_frame: FrameCallback,
    cancel: CancellationToken,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK * 2);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    tracing::info!("Radio stream closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "Radio read error");
                    break;
                }
            },
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match api::decode_frame(&buf) {
                DecodeResult::Frame(frame, consumed) => {
                    buf.advance(consumed);
                    tracing::trace!(kind = frame.kind(), "Received API frame");
                    on_frame(frame);
                }
                DecodeResult::Invalid(skip) => {
                    tracing::debug!(bytes = skip, "Discarding unframed radio bytes");
                    buf.advance(skip);
                }
                DecodeResult::Incomplete => break,
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}
