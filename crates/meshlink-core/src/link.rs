//! Radio link trait.
//!
//! The [`RadioLink`] trait abstracts over the driver that owns a radio: it
//! turns [`Command`]s into bytes on the wire, and hands every decoded
//! [`Frame`] to the [`FrameCallback`] supplied when the link was opened.
//!
//! The gateway server holds exactly one `RadioLink` for the physical radio;
//! gateway clients implement the same trait so that consumers can issue
//! radio commands without caring whether the radio is local or remote.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::frame::{Command, Frame};

/// Callback invoked by a link's receive task for every inbound frame.
///
/// Called from the link's own task; implementations must not block.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// A handle to an open radio link.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Encode and write one command.
    ///
    /// Returns once the encoded bytes have been written to the underlying
    /// stream. Fails on I/O error or if the link has been halted.
    async fn send(&self, command: &Command) -> Result<()>;

    /// Stop the receive task and close the underlying stream.
    ///
    /// After `halt()`, [`send`](RadioLink::send) returns
    /// [`Error::NotConnected`](crate::error::Error::NotConnected). Halting
    /// twice is not an error.
    async fn halt(&self) -> Result<()>;

    /// Whether the link is still open.
    fn is_connected(&self) -> bool;
}

#[async_trait]
impl<T: RadioLink + ?Sized> RadioLink for Arc<T> {
    async fn send(&self, command: &Command) -> Result<()> {
        (**self).send(command).await
    }

    async fn halt(&self) -> Result<()> {
        (**self).halt().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
