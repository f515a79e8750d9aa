//! Gateway TCP client.
//!
//! [`GatewayClient`] is the other end of the gateway wire protocol. It
//! writes length-prefixed [`Command`]s and delivers every [`Frame`] the
//! gateway fans out on an unbounded channel. It also implements
//! [`RadioLink`], so code written against a local radio works unchanged
//! against a remote one.
//!
//! # Example
//!
//! ```no_run
//! use meshlink_core::Command;
//! use meshlink_gateway::GatewayClient;
//!
//! # async fn example() -> meshlink_core::Result<()> {
//! let (client, mut frames) = GatewayClient::connect("127.0.0.1:9999").await?;
//!
//! let dest = "00:13:a2:00:40:32:dc:dc".parse().unwrap();
//! client.send_command(&Command::transmit(1, dest, b"R".to_vec())).await?;
//!
//! while let Some(frame) = frames.recv().await {
//!     println!("{:?}", frame);
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use meshlink_core::error::{Error, Result};
use meshlink_core::frame::{Command, Frame};
use meshlink_core::link::RadioLink;

use crate::wire;

/// Default connection timeout (5 seconds).
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection to a radio gateway.
pub struct GatewayClient {
    writer: Mutex<Option<OwnedWriteHalf>>,
    read_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    addr: String,
}

impl GatewayClient {
    /// Connect to a gateway using the default timeout.
    ///
    /// Returns the client and the receiver for frames fanned out by the
    /// gateway. The receiver closes when the connection ends.
    pub async fn connect(addr: &str) -> Result<(Self, mpsc::UnboundedReceiver<Frame>)> {
        Self::connect_with_timeout(addr, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connect to a gateway with a specified timeout.
    pub async fn connect_with_timeout(
        addr: &str,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Frame>)> {
        tracing::debug!(addr = %addr, timeout_ms = timeout.as_millis(), "Connecting to gateway");

        let stream = tokio::time::timeout(timeout, open_stream(addr))
            .await
            .map_err(|_| {
                tracing::error!(addr = %addr, "Gateway connection timed out");
                Error::Timeout
            })??;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::info!(addr = %addr, "Connected to gateway");
        Ok(Self::from_stream(stream, addr.to_string()))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: TcpStream, addr: String) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let read_handle = {
            let connected = Arc::clone(&connected);
            let addr = addr.clone();
            tokio::spawn(async move {
                read_loop(reader, tx, &addr).await;
                connected.store(false, Ordering::SeqCst);
            })
        };

        let client = GatewayClient {
            writer: Mutex::new(Some(writer)),
            read_handle: std::sync::Mutex::new(Some(read_handle)),
            connected,
            addr,
        };
        (client, rx)
    }

    /// The gateway address this client connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one command to the gateway.
    pub async fn send_command(&self, command: &Command) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(Error::NotConnected)?;
        wire::write_message(w, command).await.map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to send command");
            e
        })?;
        tracing::trace!(command = command.name(), frame_id = command.frame_id(), "Command sent");
        Ok(())
    }

    /// Close the connection and stop the read task.
    pub async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);

        {
            let mut writer = self.writer.lock().await;
            if let Some(mut w) = writer.take() {
                let _ = w.shutdown().await;
                tracing::debug!(addr = %self.addr, "Gateway connection closed");
            }
        }

        let handle = self
            .read_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(h) = handle {
            h.abort();
        }
        Ok(())
    }

    /// Whether the connection is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioLink for GatewayClient {
    async fn send(&self, command: &Command) -> Result<()> {
        self.send_command(command).await
    }

    async fn halt(&self) -> Result<()> {
        self.disconnect().await
    }

    fn is_connected(&self) -> bool {
        GatewayClient::is_connected(self)
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.read_handle.lock() {
            if let Some(h) = handle.take() {
                h.abort();
            }
        }
    }
}

/// Resolve `addr` and connect with keep-alive enabled.
async fn open_stream(addr: &str) -> Result<TcpStream> {
    let mut last_err = None;
    for resolved in lookup_host(addr).await? {
        match connect_keepalive(resolved).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(match last_err {
        Some(e) => Error::Transport(format!("failed to connect to {}: {}", addr, e)),
        None => Error::Transport(format!("no addresses found for {}", addr)),
    })
}

async fn connect_keepalive(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    socket.connect(addr).await
}

/// Background task that decodes frames from the gateway.
async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::UnboundedSender<Frame>, addr: &str) {
    loop {
        match wire::read_message::<_, Frame>(&mut reader).await {
            Ok(Some(frame)) => {
                tracing::trace!(kind = frame.kind(), "Frame from gateway");
                if tx.send(frame).is_err() {
                    tracing::debug!(addr = %addr, "Frame receiver dropped");
                }
            }
            Ok(None) => {
                tracing::info!(addr = %addr, "Gateway closed the connection");
                break;
            }
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "Failed to read from gateway");
                break;
            }
        }
    }
}
