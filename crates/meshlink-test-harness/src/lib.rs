//! meshlink-test-harness: Test utilities for meshlink.
//!
//! This crate provides [`MockLink`], a [`RadioLink`](meshlink_core::RadioLink)
//! that records every command it is asked to send and lets tests inject
//! frames as if they had arrived from the radio.

pub mod mock_link;

pub use mock_link::{MockLink, WIRE_SEPARATOR};
