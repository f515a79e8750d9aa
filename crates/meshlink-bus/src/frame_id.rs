//! Frame id allocation.
//!
//! The radio echoes a command's frame id in its status or response frame.
//! Id 0 tells the radio not to respond at all, so ids cycle through
//! `1..=255`.

use std::sync::atomic::{AtomicU8, Ordering};

/// A wrapping frame id counter that never yields 0.
#[derive(Debug, Default)]
pub struct FrameIdCounter(AtomicU8);

impl FrameIdCounter {
    /// A counter whose first id is 1.
    pub const fn new() -> Self {
        FrameIdCounter(AtomicU8::new(0))
    }

    /// Take the next id.
    pub fn next_id(&self) -> u8 {
        let prev = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| Some(successor(id)))
            .unwrap_or_else(|id| id);
        successor(prev)
    }
}

fn successor(id: u8) -> u8 {
    if id == u8::MAX {
        1
    } else {
        id + 1
    }
}

static PROCESS_FRAME_IDS: FrameIdCounter = FrameIdCounter::new();

/// Take the next frame id from the process-wide counter.
pub fn next_frame_id() -> u8 {
    PROCESS_FRAME_IDS.next_id()
}
