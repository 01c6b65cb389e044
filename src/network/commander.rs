use std::collections::HashMap;

use tokio::sync::oneshot;

/// Table of callers waiting on command responses, keyed by sequence
///
/// The connector registers a waiter when a command goes out and resolves
/// it when the state machine reports the assembled response. Dropping a
/// sender fails the waiter, which the connector surfaces as
/// [`Error::NotConnected`].
///
/// [`Error::NotConnected`]: crate::core::Error::NotConnected
#[derive(Debug, Default)]
pub(crate) struct Commander {
    waiters: HashMap<u8, oneshot::Sender<String>>,
}

impl Commander {
    /// Creates an empty table
    pub fn new() -> Self {
        Commander::default()
    }

    /// Registers a waiter for a command sequence
    ///
    /// A previous waiter on the same sequence is cancelled; the state
    /// machine guarantees sequences are unique among in-flight commands,
    /// so this only occurs after an invalidation raced a reuse.
    pub fn register(&mut self, sequence: u8) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(sequence, tx);
        rx
    }

    /// Resolves the waiter for a sequence, if one is still interested
    pub fn complete(&mut self, sequence: u8, message: String) {
        if let Some(waiter) = self.waiters.remove(&sequence) {
            // The caller may have timed out in the meantime; that is fine.
            let _ = waiter.send(message);
        }
    }

    /// Drops the waiter for a sequence, failing its receiver
    pub fn cancel(&mut self, sequence: u8) {
        self.waiters.remove(&sequence);
    }

    /// Fails every outstanding waiter (session teardown)
    pub fn fail_all(&mut self) {
        self.waiters.clear();
    }

    /// Returns the number of outstanding waiters
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}
