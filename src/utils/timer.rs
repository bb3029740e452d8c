//! Arm/cancel one-shot timer for deferred actions, plus wall-clock helper.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{self, Duration, Instant};

/// Returns the current wall-clock time as unix-epoch milliseconds. Used
/// for vote deadlines, which must survive being shipped between servers.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One-shot timer that can be armed, cancelled, and awaited inside a
/// `select!` loop. When unarmed, `ticked()` never completes.
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// Creates a new unarmed timer.
    pub fn new() -> Self {
        Timer { deadline: None }
    }

    /// Arms the timer to fire after the given duration, replacing any
    /// previously armed deadline.
    pub fn kickoff(&mut self, dur: Duration) {
        self.deadline = Some(Instant::now() + dur);
    }

    /// Disarms the timer.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// True if currently armed.
    pub fn armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Completes when the armed deadline passes (and disarms); pends
    /// forever when unarmed. Safe to drop and re-await across `select!`
    /// iterations since the deadline is kept until it actually fires.
    pub async fn ticked(&mut self) {
        match self.deadline {
            Some(ddl) => {
                time::sleep_until(ddl).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}
