use std::sync::atomic::{AtomicUsize, Ordering};

/// A candidate host plus the number of servers this process has running on it.
///
/// The counter is only mutated by the launcher (+1 on success) and by
/// termination (-1 on confirmed exit); it never drops below zero.
#[derive(Debug)]
pub struct HostRecord {
    hostname: String,
    sessions: AtomicUsize,
}

impl HostRecord {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            sessions: AtomicUsize::new(0),
        }
    }

    pub fn with_sessions(hostname: impl Into<String>, sessions: usize) -> Self {
        Self {
            hostname: hostname.into(),
            sessions: AtomicUsize::new(sessions),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn increment(&self) -> usize {
        self.sessions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the new count, or `None` if the counter was already zero.
    pub fn decrement(&self) -> Option<usize> {
        self.sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }
}
