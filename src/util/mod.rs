//! Utility module
//!
//! Small helpers shared by the connector internals.

use tokio::time::{Duration, Instant};

/// Tracks when traffic last moved in each direction of a session
///
/// Built on [`tokio::time::Instant`] so that tests running under a paused
/// clock can advance it deterministically.
#[derive(Debug, Clone, Copy)]
pub struct ActivityClock {
    last_received: Instant,
    last_command: Instant,
}

impl ActivityClock {
    /// Starts the clock with both directions marked as active now
    pub fn new() -> Self {
        let now = Instant::now();
        ActivityClock {
            last_received: now,
            last_command: now,
        }
    }

    /// Records a datagram arriving from the server
    pub fn mark_received(&mut self) {
        self.last_received = Instant::now();
    }

    /// Records a command going out to the server
    pub fn mark_command(&mut self) {
        self.last_command = Instant::now();
    }

    /// Returns how long the server has been silent
    pub fn silence(&self) -> Duration {
        self.last_received.elapsed()
    }

    /// Returns how long ago the last command was sent
    pub fn idle(&self) -> Duration {
        self.last_command.elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}
