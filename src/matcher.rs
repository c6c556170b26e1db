//! Output matching against a live, append-only buffer

use std::time::Duration;

use tokio::time::Instant;

use crate::process::OutputBuffer;

/// Result of waiting for a substring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Found,
    /// The deadline passed first
    NotFoundWithinTimeout,
    /// The stream ended without the text ever appearing
    StreamClosed,
}

impl MatchOutcome {
    pub fn is_found(self) -> bool {
        self == MatchOutcome::Found
    }
}

/// Wait until `text` appears anywhere in `buffer`, up to `timeout`
///
/// The search runs over the whole accumulated buffer on every update, so
/// text split across reads is still found. Matching is exact and
/// case-sensitive.
pub async fn await_substring(buffer: &OutputBuffer, text: &str, timeout: Duration) -> MatchOutcome {
    let deadline = Instant::now() + timeout;
    let mut updates = buffer.subscribe();

    loop {
        if buffer.contains(text) {
            return MatchOutcome::Found;
        }
        if buffer.is_closed() {
            return MatchOutcome::StreamClosed;
        }
        match tokio::time::timeout_at(deadline, updates.changed()).await {
            Ok(Ok(())) => continue,
            // Writer side gone: one last look at what was written
            Ok(Err(_)) => {
                return if buffer.contains(text) {
                    MatchOutcome::Found
                } else {
                    MatchOutcome::StreamClosed
                };
            }
            Err(_) => {
                return if buffer.contains(text) {
                    MatchOutcome::Found
                } else {
                    MatchOutcome::NotFoundWithinTimeout
                };
            }
        }
    }
}
