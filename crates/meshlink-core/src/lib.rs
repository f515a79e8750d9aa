//! meshlink-core: Core types, traits, and error definitions for meshlink.
//!
//! This crate defines the radio-agnostic pieces every other meshlink crate
//! shares: the frames and commands exchanged with radio nodes, node
//! addresses, the [`RadioLink`] driver trait, and the error type.
//!
//! # Key types
//!
//! - [`Frame`] / [`Command`] -- inbound and outbound radio messages
//! - [`Address`] -- 64-bit node address with its routing-key text form
//! - [`RadioLink`] -- driver handle for sending commands to a radio
//! - [`Error`] / [`Result`] -- error handling

pub mod address;
pub mod error;
pub mod frame;
pub mod link;

pub use address::{Address, ParseAddressError};
pub use error::{Error, Result};
pub use frame::{
    AnalogReading, AtCommand, Command, DeliveryStatus, Frame, IoSample, RemoteCommandStatus,
};
pub use link::{FrameCallback, RadioLink};
