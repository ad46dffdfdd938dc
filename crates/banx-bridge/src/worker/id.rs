//! Correlation id generation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::bridge::protocol::MsgId;

/// Width of one counter window.
pub const ID_WINDOW: Duration = Duration::from_millis(100);

/// Generates correlation ids from a coarse timestamp and a per-window counter.
///
/// Every id in a window shares the window's start timestamp, and the counter
/// only resets when a new window opens, so ids never repeat unless more than
/// `u32::MAX` are requested inside one window. A clock that steps backwards
/// keeps the current window open rather than reopening an old one.
#[derive(Debug)]
pub struct IdGenerator {
    window_start_ms: u64,
    counter: u32,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            window_start_ms: now_ms(),
            counter: 0,
        }
    }

    pub fn next_id(&mut self) -> MsgId {
        self.next_id_at(now_ms())
    }

    pub(crate) fn next_id_at(&mut self, now_ms: u64) -> MsgId {
        if now_ms.saturating_sub(self.window_start_ms) >= ID_WINDOW.as_millis() as u64 {
            self.window_start_ms = now_ms;
            self.counter = 0;
        }
        let raw = format!("{}-{}", self.window_start_ms, self.counter);
        self.counter = self.counter.wrapping_add(1);
        MsgId::new(STANDARD.encode(raw))
    }
}

fn now_ms() -> u64 {
    // A clock before 1970 degrades to a single long window, which is still unique.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
