//! Radio gateway server.
//!
//! [`Gateway`] is the sole owner of the radio link. It accepts TCP
//! connections and runs one [`ClientSession`] per connection. Every frame
//! the radio produces is fanned out to all active sessions through
//! [`ActiveClients::dispatch`]; every command from any session goes through
//! [`Gateway::send_command`], which serializes writes to the radio.
//!
//! Two locks are involved and never nest: the active-client set is a
//! `std::sync::Mutex` held only for non-blocking queue pushes, and the radio
//! link sits behind a `tokio::sync::Mutex` held for the duration of a send.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use meshlink_core::error::{Error, Result};
use meshlink_core::frame::{Command, Frame};
use meshlink_core::link::{FrameCallback, RadioLink};

use crate::session::{ClientSession, SessionConfig};

/// Default TCP port the gateway listens on.
pub const DEFAULT_PORT: u16 = 9999;

/// Listen backlog for the gateway socket.
const LISTEN_BACKLOG: u32 = 128;

/// Pause after a failed `accept` before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Identifier assigned to each accepted connection.
pub type SessionId = u64;

// ---------------------------------------------------------------------------
// Active-client set
// ---------------------------------------------------------------------------

/// The set of sessions currently running their handling loop.
///
/// Each entry is the sending half of that session's inbound frame queue.
#[derive(Default)]
pub struct ActiveClients {
    sessions: Mutex<HashMap<SessionId, mpsc::UnboundedSender<Frame>>>,
}

impl ActiveClients {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, mpsc::UnboundedSender<Frame>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a session's queue. Returns `false` if `id` was already
    /// registered, in which case the set is unchanged.
    pub fn add(&self, id: SessionId, queue: mpsc::UnboundedSender<Frame>) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(id, queue);
        tracing::debug!(session = id, active = sessions.len(), "Client registered");
        true
    }

    /// Deregister a session. Returns `false` if it was not registered.
    pub fn remove(&self, id: SessionId) -> bool {
        let mut sessions = self.lock();
        let removed = sessions.remove(&id).is_some();
        if removed {
            tracing::debug!(session = id, active = sessions.len(), "Client deregistered");
        }
        removed
    }

    /// Append `frame` to every active session's queue.
    ///
    /// Returns the number of sessions the frame was queued for. Having no
    /// sessions is logged, not treated as a failure.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        let sessions = self.lock();
        if sessions.is_empty() {
            tracing::error!(kind = frame.kind(), "No active clients, frame dropped");
            return 0;
        }

        let reached = sessions
            .values()
            .filter(|queue| queue.send(frame.clone()).is_ok())
            .count();
        tracing::trace!(kind = frame.kind(), reached, "Frame dispatched");
        reached
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sessions are active.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Timing for each client session.
    pub session: SessionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            session: SessionConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Listen on the given address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Use the given session timing.
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// The radio gateway server.
pub struct Gateway {
    clients: Arc<ActiveClients>,
    link: tokio::sync::Mutex<Box<dyn RadioLink>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    stopped: AtomicBool,
    next_session_id: AtomicU64,
    session_config: SessionConfig,
}

impl Gateway {
    /// Open the radio link and bind the listening socket.
    ///
    /// `open_link` receives the callback that fans frames out to sessions
    /// and must return the opened link. Connections are not accepted until
    /// [`serve`](Gateway::serve) runs.
    pub async fn bind<L, F>(config: GatewayConfig, open_link: F) -> Result<Arc<Gateway>>
    where
        L: RadioLink + 'static,
        F: FnOnce(FrameCallback) -> Result<L>,
    {
        let clients = Arc::new(ActiveClients::new());
        let on_frame: FrameCallback = {
            let clients = Arc::clone(&clients);
            Arc::new(move |frame: Frame| {
                clients.dispatch(&frame);
            })
        };

        let link = open_link(on_frame)?;

        let listener = match bind_listener(config.bind_addr) {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(halt_err) = link.halt().await {
                    tracing::warn!(error = %halt_err, "Failed to halt radio link");
                }
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;

        Ok(Arc::new(Gateway {
            clients,
            link: tokio::sync::Mutex::new(Box::new(link)),
            listener: Mutex::new(Some(listener)),
            local_addr,
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
            session_config: config.session,
        }))
    }

    /// The address the gateway is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The active-client set.
    pub fn clients(&self) -> Arc<ActiveClients> {
        Arc::clone(&self.clients)
    }

    /// Fan a frame out to every active session.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        self.clients.dispatch(frame)
    }

    /// Forward a command to the radio.
    ///
    /// Concurrent callers are serialized, so the bytes of two commands never
    /// interleave on the link.
    pub async fn send_command(&self, command: &Command) -> Result<()> {
        let link = self.link.lock().await;
        link.send(command).await
    }

    /// Accept connections until [`shutdown`](Gateway::shutdown) is called.
    ///
    /// May only be called once.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(Error::NotConnected)?;

        tracing::info!(addr = %self.local_addr, "Gateway listening");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        drop(listener);
        tracing::info!("Gateway stopped accepting connections");
        Ok(())
    }

    fn spawn_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session = id, peer = %peer, "Client connected");

        let span = tracing::info_span!("session", id, peer = %peer);
        let session = ClientSession::new(
            id,
            peer,
            stream,
            Arc::clone(self),
            self.session_config.clone(),
        );
        tokio::spawn(session.run().instrument(span));
    }

    /// Stop accepting connections and halt the radio link.
    ///
    /// Safe to call from a signal handler task while [`serve`](Gateway::serve)
    /// runs, and safe to call more than once. Running sessions are not
    /// terminated.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Gateway shutting down");

        self.cancel.cancel();
        // Closes the socket if serve() never took it.
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let link = self.link.lock().await;
        link.halt().await
    }

    /// Whether [`shutdown`](Gateway::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Bind a listening socket with address reuse and keep-alive enabled.
///
/// Accepted sockets inherit `SO_KEEPALIVE` from the listener.
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket
        .bind(addr)
        .map_err(|e| Error::Transport(format!("failed to bind {}: {}", addr, e)))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| Error::Transport(format!("failed to listen on {}: {}", addr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use meshlink_core::{Address, AtCommand};
    use meshlink_test_harness::MockLink;
    use tokio::io::AsyncWriteExt;

    fn node() -> Address {
        "00:13:a2:00:40:32:dc:dc".parse().unwrap()
    }

    fn rx_frame(data: &[u8]) -> Frame {
        Frame::ZbRx {
            source_addr_long: node(),
            source_addr: 0xDAE0,
            options: 0x01,
            rf_data: data.to_vec(),
        }
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig::default()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .session(SessionConfig {
                read_timeout: Duration::from_millis(20),
                dequeue_timeout: Duration::from_millis(20),
                payload_timeout: Duration::from_millis(100),
            })
    }

    async fn start_gateway(mock: &MockLink) -> Arc<Gateway> {
        let link = mock.clone();
        let gateway = Gateway::bind(test_config(), move |on_frame| {
            link.set_callback(on_frame);
            Ok(link)
        })
        .await
        .unwrap();

        let server = Arc::clone(&gateway);
        tokio::spawn(async move { server.serve().await });
        gateway
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn connect_clients(gateway: &Arc<Gateway>, n: usize) -> Vec<TcpStream> {
        let mut streams = Vec::new();
        for _ in 0..n {
            streams.push(TcpStream::connect(gateway.local_addr()).await.unwrap());
        }
        streams
    }

    async fn read_frame(stream: &mut TcpStream) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), wire::read_message::<_, Frame>(stream))
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("connection closed")
    }

    // -- ActiveClients ---------------------------------------------------

    #[test]
    fn dispatch_reaches_every_registered_queue() {
        let clients = ActiveClients::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        assert!(clients.add(1, tx1));
        assert!(clients.add(2, tx2));

        let frame = rx_frame(b"#107:223#\r\n");
        assert_eq!(clients.dispatch(&frame), 2);
        assert_eq!(rx1.try_recv().unwrap(), frame);
        assert_eq!(rx2.try_recv().unwrap(), frame);
    }

    #[test]
    fn dispatch_with_no_clients_is_not_an_error() {
        let clients = ActiveClients::new();
        assert_eq!(clients.dispatch(&Frame::Status { status: 2 }), 0);
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let clients = ActiveClients::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(clients.add(7, tx.clone()));
        assert!(!clients.add(7, tx));
        assert_eq!(clients.len(), 1);

        assert!(clients.remove(7));
        assert!(!clients.remove(7));
        assert!(clients.is_empty());
    }

    #[test]
    fn dispatch_skips_closed_queues() {
        let clients = ActiveClients::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        clients.add(1, tx1);
        clients.add(2, tx2);
        drop(rx1);

        assert_eq!(clients.dispatch(&Frame::Status { status: 0 }), 1);
        assert!(rx2.try_recv().is_ok());
    }

    // -- Gateway over loopback TCP ---------------------------------------

    #[tokio::test]
    async fn frame_reaches_all_connected_sessions_only() {
        let mock = MockLink::new();
        let gateway = start_gateway(&mock).await;

        let mut early = connect_clients(&gateway, 3).await;
        let clients = gateway.clients();
        wait_until(|| clients.len() == 3).await;

        let first = rx_frame(b"first");
        assert!(mock.inject(first.clone()));
        for stream in early.iter_mut() {
            assert_eq!(read_frame(stream).await, first);
        }

        let mut late = connect_clients(&gateway, 1).await.remove(0);
        wait_until(|| clients.len() == 4).await;

        let second = rx_frame(b"second");
        assert!(mock.inject(second.clone()));
        assert_eq!(read_frame(&mut late).await, second);
        for stream in early.iter_mut() {
            assert_eq!(read_frame(stream).await, second);
        }

        gateway.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_commands_do_not_interleave_on_link() {
        let mock = MockLink::new().with_chunk_size(1);
        let gateway = start_gateway(&mock).await;

        let streams = connect_clients(&gateway, 3).await;
        let mut tasks = Vec::new();
        for (i, mut stream) in streams.into_iter().enumerate() {
            tasks.push(tokio::spawn(async move {
                for j in 0..5u8 {
                    let data = format!("client {} message {}", i, j).into_bytes();
                    let cmd = Command::transmit(j + 1, node(), data);
                    wire::write_message(&mut stream, &cmd).await.unwrap();
                }
                stream
            }));
        }
        let mut held = Vec::new();
        for task in tasks {
            held.push(task.await.unwrap());
        }

        wait_until(|| mock.sent().len() == 15).await;
        let on_wire = mock.wire_commands().expect("interleaved bytes on link");
        assert_eq!(on_wire.len(), 15);
        assert_eq!(on_wire, mock.sent());

        gateway.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_command_does_not_end_session() {
        let mock = MockLink::new();
        let gateway = start_gateway(&mock).await;
        let mut stream = connect_clients(&gateway, 1).await.remove(0);

        stream.write_all(&[0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']).await.unwrap();
        let cmd = Command::at(3, AtCommand(*b"SH"), None);
        wire::write_message(&mut stream, &cmd).await.unwrap();

        wait_until(|| mock.sent().len() == 1).await;
        assert_eq!(mock.sent()[0], cmd);
        assert_eq!(gateway.clients().len(), 1);

        gateway.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn link_failure_does_not_end_session() {
        let mock = MockLink::new();
        let gateway = start_gateway(&mock).await;
        let mut stream = connect_clients(&gateway, 1).await.remove(0);
        let clients = gateway.clients();
        wait_until(|| clients.len() == 1).await;

        mock.set_failing(true);
        let lost = Command::at(1, AtCommand(*b"SH"), None);
        wire::write_message(&mut stream, &lost).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        mock.set_failing(false);

        let kept = Command::at(2, AtCommand(*b"SL"), None);
        wire::write_message(&mut stream, &kept).await.unwrap();

        wait_until(|| mock.sent().len() == 1).await;
        assert_eq!(mock.sent()[0], kept);
        assert_eq!(clients.len(), 1);

        gateway.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_deregisters_session() {
        let mock = MockLink::new();
        let gateway = start_gateway(&mock).await;
        let clients = gateway.clients();

        let stream = connect_clients(&gateway, 1).await.remove(0);
        wait_until(|| clients.len() == 1).await;

        drop(stream);
        wait_until(|| clients.is_empty()).await;

        gateway.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn oversize_header_ends_session() {
        let mock = MockLink::new();
        let gateway = start_gateway(&mock).await;
        let clients = gateway.clients();

        let mut stream = connect_clients(&gateway, 1).await.remove(0);
        wait_until(|| clients.len() == 1).await;

        stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        wait_until(|| clients.is_empty()).await;

        let next = wire::read_message::<_, Frame>(&mut stream).await;
        assert!(matches!(next, Ok(None) | Err(_)));

        gateway.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn short_header_is_discarded_and_session_continues() {
        let mock = MockLink::new();
        let gateway = start_gateway(&mock).await;
        let clients = gateway.clients();

        let mut stream = connect_clients(&gateway, 1).await.remove(0);
        wait_until(|| clients.len() == 1).await;

        stream.write_all(&[0x00, 0x07]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let cmd = Command::at(9, AtCommand(*b"NJ"), None);
        wire::write_message(&mut stream, &cmd).await.unwrap();
        wait_until(|| mock.sent().len() == 1).await;
        assert_eq!(mock.sent()[0], cmd);
        assert_eq!(clients.len(), 1);

        let frame = rx_frame(b"#853:0#\r\n");
        assert!(mock.inject(frame.clone()));
        assert_eq!(read_frame(&mut stream).await, frame);

        gateway.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stalled_payload_ends_session() {
        let mock = MockLink::new();
        let gateway = start_gateway(&mock).await;
        let clients = gateway.clients();

        let mut healthy = connect_clients(&gateway, 1).await.remove(0);
        wait_until(|| clients.len() == 1).await;
        let mut stalled = connect_clients(&gateway, 1).await.remove(0);
        wait_until(|| clients.len() == 2).await;

        stalled.write_all(&[0, 0, 0, 10, b'{', b'"']).await.unwrap();
        wait_until(|| clients.len() == 1).await;
        assert!(mock.sent().is_empty());

        let next = wire::read_message::<_, Frame>(&mut stalled).await;
        assert!(matches!(next, Ok(None) | Err(_)));

        let frame = rx_frame(b"still flowing");
        assert!(mock.inject(frame.clone()));
        assert_eq!(read_frame(&mut healthy).await, frame);

        gateway.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_halts_link() {
        let mock = MockLink::new();
        let gateway = start_gateway(&mock).await;
        let addr = gateway.local_addr();

        gateway.shutdown().await.unwrap();
        gateway.shutdown().await.unwrap();
        assert!(gateway.is_shutdown());
        assert_eq!(mock.halt_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn serve_returns_after_shutdown() {
        let mock = MockLink::new();
        let link = mock.clone();
        let gateway = Gateway::bind(test_config(), move |on_frame| {
            link.set_callback(on_frame);
            Ok(link)
        })
        .await
        .unwrap();

        let server = Arc::clone(&gateway);
        let handle = tokio::spawn(async move { server.serve().await });

        gateway.shutdown().await.unwrap();
        let served = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("serve did not return")
            .unwrap();
        assert!(served.is_ok());
        assert!(matches!(gateway.serve().await, Err(Error::NotConnected)));
    }
}
