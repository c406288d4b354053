//! Notification classification and stale-status filtering.
//!
//! The heater firmware is inconsistent about which handle a frame arrives on,
//! so frames are classified by payload length rather than by source handle.

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::protocol::codec::{decode_status, is_confirmation, Level, COMMAND_LENGTH};
use crate::utils::to_hex;

/// Frames at least this long are candidate status reports.
pub const STATUS_CANDIDATE_LENGTH: usize = 15;

/// Length of the diagnostic status-byte frame.
pub const STATUS_BYTE_LENGTH: usize = 3;

/// Default window during which a contradicting status report is treated as stale.
pub const DEFAULT_STALE_WINDOW: Duration = Duration::from_secs(1);

/// A 2-byte command echo received from the heater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    /// Handle the frame arrived on.
    pub handle: u16,
    /// The echoed command bytes.
    pub bytes: [u8; COMMAND_LENGTH],
}

/// A classified notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Command echo.
    Confirmation([u8; COMMAND_LENGTH]),
    /// Parsed heater level.
    StatusReport(Level),
    /// 3-byte diagnostic frame.
    StatusByte(Vec<u8>),
    /// Anything else, including status-sized frames that did not decode.
    Unclassified(Vec<u8>),
}

/// Classify a notification payload.
pub fn classify(source_handle: u16, payload: &[u8]) -> Notification {
    let notification = if is_confirmation(payload) {
        Notification::Confirmation([payload[0], payload[1]])
    } else if payload.len() >= STATUS_CANDIDATE_LENGTH {
        match decode_status(payload) {
            Some(level) => Notification::StatusReport(level),
            None => Notification::Unclassified(payload.to_vec()),
        }
    } else if payload.len() == STATUS_BYTE_LENGTH {
        Notification::StatusByte(payload.to_vec())
    } else {
        Notification::Unclassified(payload.to_vec())
    };

    trace!(
        "Classified {} bytes from handle {:#06x} ({}) as {:?}",
        payload.len(),
        source_handle,
        to_hex(payload),
        notification
    );

    notification
}

/// What to do with a decoded status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Hand the report to subscribers.
    Deliver,
    /// Drop the report; it contradicts a command issued `age` ago.
    Suppress {
        /// Level the last command asked for.
        expected: Level,
        /// Time since the command was issued.
        age: Duration,
    },
}

/// Suppresses status reports that race a just-issued command.
///
/// After a command the heater can still report its previous level for a
/// short while. A report that disagrees with the commanded level inside the
/// window is dropped. A matching report, or any report after the window,
/// clears the expectation and is delivered.
///
/// Known limitation: a genuine second level change within the window (for
/// example from the vendor app) is suppressed as well.
#[derive(Debug, Clone)]
pub struct StaleFilter {
    window: Duration,
    expected: Option<(Level, Instant)>,
}

impl StaleFilter {
    /// Create a filter with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            expected: None,
        }
    }

    /// Record that a command for `level` was issued at `at`.
    pub fn expect(&mut self, level: Level, at: Instant) {
        self.expected = Some((level, at));
    }

    /// Forget any pending expectation.
    pub fn clear(&mut self) {
        self.expected = None;
    }

    /// The level currently expected, if any.
    pub fn expected(&self) -> Option<Level> {
        self.expected.map(|(level, _)| level)
    }

    /// The configured window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide whether a report for `level` observed at `now` is delivered.
    pub fn evaluate(&mut self, level: Level, now: Instant) -> FilterDecision {
        let Some((expected, issued_at)) = self.expected else {
            return FilterDecision::Deliver;
        };

        let age = now.saturating_duration_since(issued_at);
        if age < self.window && level != expected {
            return FilterDecision::Suppress { expected, age };
        }

        self.expected = None;
        FilterDecision::Deliver
    }
}

impl Default for StaleFilter {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_WINDOW)
    }
}
