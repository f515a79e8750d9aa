//! XBee radio driver for meshlink.
//!
//! This crate provides the concrete [`RadioLink`](meshlink_core::RadioLink)
//! used by the gateway to drive a locally attached XBee module in API mode:
//!
//! - [`api`]: pure byte-level encoding of commands and decoding of frames
//! - [`XBeeLink`]: the link driver, over any async byte stream
//! - [`SerialConfig`]: serial port settings for `tokio-serial`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshlink_core::{Command, FrameCallback, RadioLink};
//! use meshlink_xbee::{SerialConfig, XBeeLink};
//!
//! # async fn example() -> meshlink_core::Result<()> {
//! let on_frame: FrameCallback = Arc::new(|frame| println!("{:?}", frame));
//! let link = XBeeLink::open_serial("/dev/ttyUSB0", &SerialConfig::default(), on_frame)?;
//!
//! let dest = "00:13:a2:00:40:32:dc:dc".parse().unwrap();
//! link.send(&Command::transmit(1, dest, b"R".to_vec())).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod link;
pub mod serial;

pub use link::XBeeLink;
pub use serial::{open_serial_stream, DataBits, FlowControl, Parity, SerialConfig, StopBits};
