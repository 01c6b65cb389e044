use std::collections::VecDeque;

use crate::core::{Error, Result};

/// A bounded set of recently seen sequence numbers
///
/// Used to deduplicate retransmitted packets: the server repeats a
/// message until it is acknowledged, and network instability can make
/// both the original and the repeats arrive. Only the `window` most
/// recent sequences are remembered, so after a storm of more than
/// `window` losses a duplicate can slip through; that is accepted
/// behaviour given the 256-value sequence space.
#[derive(Debug)]
pub struct NonceCheck {
    seen: VecDeque<u8>,
    window: usize,
}

impl NonceCheck {
    /// Creates a check remembering the last `window` sequences
    ///
    /// Fails when `window` is zero (which would disable dedup entirely)
    /// or exceeds 255 (sequences only take 256 distinct values).
    pub fn new(window: usize) -> Result<Self> {
        if window == 0 || window > 255 {
            return Err(Error::config(format!(
                "window must be within 1-255, not {window}"
            )));
        }

        Ok(NonceCheck {
            seen: VecDeque::with_capacity(window),
            window,
        })
    }

    /// Records a sequence, returning false if it was recently seen
    pub fn check(&mut self, sequence: u8) -> bool {
        if self.seen.contains(&sequence) {
            return false;
        }

        if self.seen.len() == self.window {
            self.seen.pop_front();
        }
        self.seen.push_back(sequence);
        true
    }

    /// Forgets all recorded sequences
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Returns the configured window size
    pub fn window(&self) -> usize {
        self.window
    }
}
