//! Mock radio link for deterministic testing.
//!
//! [`MockLink`] implements the [`RadioLink`] trait without hardware. Every
//! command sent through it is recorded, and its serialized bytes are written
//! to a shared "wire" log in small chunks with a yield between chunks, the
//! way a real serial write can be split across several syscalls. A caller
//! that forgets to serialize sends will therefore produce interleaved bytes
//! in the wire log.
//!
//! Frames can be injected as if the radio had received them; they are
//! delivered to the callback the link was opened with.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use meshlink_core::{Frame, FrameCallback};
//! use meshlink_test_harness::MockLink;
//!
//! let on_frame: FrameCallback = Arc::new(|frame| println!("got {:?}", frame));
//! let link = MockLink::open(on_frame);
//! assert!(link.inject(Frame::Status { status: 2 }));
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use meshlink_core::error::{Error, Result};
use meshlink_core::frame::{Command, Frame};
use meshlink_core::link::{FrameCallback, RadioLink};

/// Default number of bytes written per chunk.
const DEFAULT_CHUNK_SIZE: usize = 4;

/// Separator written after each command in the wire log.
pub const WIRE_SEPARATOR: u8 = b'\n';

#[derive(Default)]
struct Shared {
    sent: Mutex<Vec<Command>>,
    wire: Mutex<Vec<u8>>,
    on_frame: Mutex<Option<FrameCallback>>,
}

/// A mock [`RadioLink`] for testing gateways and consumers.
///
/// Cloning a `MockLink` yields another handle to the same recorded state,
/// so a test can keep one handle while the code under test owns the other.
#[derive(Clone)]
pub struct MockLink {
    shared: Arc<Shared>,
    chunk_size: usize,
    connected: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
    halts: Arc<AtomicUsize>,
}

impl MockLink {
    /// Create a connected mock link with no frame callback.
    pub fn new() -> Self {
        MockLink {
            shared: Arc::new(Shared::default()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connected: Arc::new(AtomicBool::new(true)),
            failing: Arc::new(AtomicBool::new(false)),
            halts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a connected mock link that delivers injected frames to
    /// `on_frame`, mirroring how a real driver is opened.
    pub fn open(on_frame: FrameCallback) -> Self {
        let link = Self::new();
        link.set_callback(on_frame);
        link
    }

    /// Set the number of bytes written per chunk (minimum 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Replace the frame callback.
    pub fn set_callback(&self, on_frame: FrameCallback) {
        *lock(&self.shared.on_frame) = Some(on_frame);
    }

    /// Deliver a frame as if the radio had received it.
    ///
    /// Returns `false` if no callback is installed or the link is halted.
    pub fn inject(&self, frame: Frame) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let callback = lock(&self.shared.on_frame).clone();
        match callback {
            Some(cb) => {
                cb(frame);
                true
            }
            None => false,
        }
    }

    /// All commands sent so far, in completion order.
    pub fn sent(&self) -> Vec<Command> {
        lock(&self.shared.sent).clone()
    }

    /// Raw bytes written to the wire log so far.
    pub fn wire_bytes(&self) -> Vec<u8> {
        lock(&self.shared.wire).clone()
    }

    /// Split the wire log back into commands.
    ///
    /// Fails with [`Error::Codec`] if any record is not a complete command,
    /// which is what interleaved writes produce.
    pub fn wire_commands(&self) -> Result<Vec<Command>> {
        self.wire_bytes()
            .split(|&b| b == WIRE_SEPARATOR)
            .filter(|record| !record.is_empty())
            .map(|record| serde_json::from_slice(record).map_err(|e| Error::Codec(e.to_string())))
            .collect()
    }

    /// Make subsequent sends fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of times [`halt`](RadioLink::halt) has been called.
    pub fn halt_count(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RadioLink for MockLink {
    async fn send(&self, command: &Command) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transport("mock link failure".into()));
        }

        let mut bytes = serde_json::to_vec(command).map_err(|e| Error::Codec(e.to_string()))?;
        bytes.push(WIRE_SEPARATOR);

        for chunk in bytes.chunks(self.chunk_size) {
            lock(&self.shared.wire).extend_from_slice(chunk);
            tokio::task::yield_now().await;
        }

        lock(&self.shared.sent).push(command.clone());
        Ok(())
    }

    async fn halt(&self) -> Result<()> {
        self.halts.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_core::{Address, AtCommand};

    fn node() -> Address {
        "00:13:a2:00:40:32:dc:dc".parse().unwrap()
    }

    #[tokio::test]
    async fn records_sent_commands() {
        let link = MockLink::new();
        let cmd = Command::transmit(1, node(), b"R".to_vec());
        link.send(&cmd).await.unwrap();

        assert_eq!(link.sent(), vec![cmd.clone()]);
        assert_eq!(link.wire_commands().unwrap(), vec![cmd]);
    }

    #[tokio::test]
    async fn unserialized_concurrent_sends_interleave() {
        let link = MockLink::new().with_chunk_size(1);
        let a = Command::transmit(1, node(), b"first".to_vec());
        let b = Command::at(2, AtCommand(*b"SH"), None);

        let (ra, rb) = tokio::join!(link.send(&a), link.send(&b));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(link.sent().len(), 2);
        assert!(link.wire_commands().is_err());
    }

    #[tokio::test]
    async fn failing_link_rejects_sends() {
        let link = MockLink::new();
        link.set_failing(true);
        let cmd = Command::at(1, AtCommand(*b"SH"), None);
        assert!(matches!(link.send(&cmd).await, Err(Error::Transport(_))));
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn halt_disconnects() {
        let link = MockLink::new();
        link.halt().await.unwrap();
        assert!(!link.is_connected());
        assert_eq!(link.halt_count(), 1);

        let cmd = Command::at(1, AtCommand(*b"SH"), None);
        assert!(matches!(link.send(&cmd).await, Err(Error::NotConnected)));
        assert!(!link.inject(Frame::Status { status: 0 }));
    }

    #[test]
    fn inject_reaches_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let link = MockLink::open(Arc::new(move |frame| sink.lock().unwrap().push(frame)));

        assert!(link.inject(Frame::Status { status: 6 }));
        assert_eq!(*seen.lock().unwrap(), vec![Frame::Status { status: 6 }]);
    }
}
