//! Per-connection client session.
//!
//! A [`ClientSession`] runs one duplex loop per accepted connection:
//!
//! 1. wait briefly for a command header; on a complete header read the
//!    payload (also bounded) and forward the command to the radio,
//! 2. wait briefly for an inbound frame from the session's queue and write
//!    it to the socket.
//!
//! The session is registered with the gateway's active-client set for
//! exactly as long as its loop runs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use meshlink_core::error::Error;
use meshlink_core::frame::{Command, Frame};

use crate::server::{ActiveClients, Gateway, SessionId};
use crate::wire::{self, HeaderRead};

/// Default wait for a command header per loop iteration.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Default wait for an outbound frame per loop iteration.
const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wait for the payload once its header has arrived.
const DEFAULT_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(1);

/// Timing for the session loop.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for a command header each iteration.
    pub read_timeout: Duration,
    /// How long to wait for an outbound frame each iteration.
    pub dequeue_timeout: Duration,
    /// How long to wait for a payload after its header.
    pub payload_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            payload_timeout: DEFAULT_PAYLOAD_TIMEOUT,
        }
    }
}

/// Session lifecycle state, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Setup,
    Active,
    Finishing,
}

/// One accepted client connection.
pub struct ClientSession {
    id: SessionId,
    peer: SocketAddr,
    stream: TcpStream,
    gateway: Arc<Gateway>,
    config: SessionConfig,
}

/// Removes the session from the active set when dropped, whichever way the
/// loop exits.
struct Registration {
    clients: Arc<ActiveClients>,
    id: SessionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.clients.remove(self.id);
    }
}

impl ClientSession {
    pub(crate) fn new(
        id: SessionId,
        peer: SocketAddr,
        stream: TcpStream,
        gateway: Arc<Gateway>,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            gateway,
            config,
        }
    }

    /// The peer's socket address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Run the session until the peer disconnects or a write fails.
    pub async fn run(mut self) {
        let mut state = State::Setup;
        let (tx, mut queue) = mpsc::unbounded_channel::<Frame>();
        let clients = self.gateway.clients();
        clients.add(self.id, tx);
        let _registration = Registration {
            clients,
            id: self.id,
        };
        tracing::debug!(?state, "New connection");

        if let Err(e) = self.stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        state = State::Active;
        tracing::debug!(?state, "Session running");

        while state == State::Active {
            if !self.read_command().await {
                state = State::Finishing;
                continue;
            }
            if !self.flush_queue(&mut queue).await {
                state = State::Finishing;
            }
        }

        tracing::debug!(?state, "Closing connection");
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(error = %e, "Socket shutdown failed");
        }
    }

    /// Read at most one command. Returns `false` if the session must end.
    async fn read_command(&mut self) -> bool {
        let len = match wire::read_header(&mut self.stream, self.config.read_timeout).await {
            Ok(HeaderRead::Complete(len)) => len,
            Ok(HeaderRead::Idle) => return true,
            Ok(HeaderRead::Closed) => {
                tracing::info!("Peer closed the connection");
                return false;
            }
            Ok(HeaderRead::Short(bytes)) => {
                tracing::error!(
                    got = bytes.len(),
                    need = wire::HEADER_LEN,
                    bytes = ?bytes,
                    "Short command header"
                );
                return true;
            }
            Err(Error::Framing(reason)) => {
                tracing::error!(%reason, "Unrecoverable framing error");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Socket read failed");
                return false;
            }
        };

        let payload = match wire::read_payload_within(
            &mut self.stream,
            len,
            self.config.payload_timeout,
        )
        .await
        {
            Ok(payload) => payload,
            Err(Error::ConnectionClosed) => {
                tracing::info!(len, "Peer closed the connection mid-command");
                return false;
            }
            Err(Error::Framing(reason)) => {
                tracing::error!(%reason, "Unrecoverable framing error");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, len, "Failed to read command payload");
                return false;
            }
        };

        match wire::decode::<Command>(&payload) {
            Ok(command) => {
                tracing::debug!(
                    command = command.name(),
                    frame_id = command.frame_id(),
                    "Forwarding command"
                );
                if let Err(e) = self.gateway.send_command(&command).await {
                    tracing::error!(error = %e, command = command.name(), "Radio send failed");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, len, "Undecodable command");
            }
        }
        true
    }

    /// Wait briefly for one frame, then write it and anything else
    /// already queued. Returns `false` if the session must end.
    async fn flush_queue(&mut self, queue: &mut mpsc::UnboundedReceiver<Frame>) -> bool {
        let first = match tokio::time::timeout(self.config.dequeue_timeout, queue.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return false,
            Err(_) => return true,
        };

        let mut next = Some(first);
        while let Some(frame) = next {
            if let Err(e) = wire::write_message(&mut self.stream, &frame).await {
                tracing::error!(error = %e, "Socket error sending frame to client");
                return false;
            }
            next = queue.try_recv().ok();
        }
        true
    }
}
