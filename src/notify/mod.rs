//! Notification sink: how the sync layer reports user-visible outcomes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::{Notification, Severity};

/// Receives every user-visible outcome of the sync layer.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Sink that only writes to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Success => tracing::info!(target: "schoolbook::notify", "{}", message),
            Severity::Info => tracing::info!(target: "schoolbook::notify", "{}", message),
            Severity::Error => tracing::warn!(target: "schoolbook::notify", "{}", message),
        }
    }
}

/// Bounded in-memory log of recent notifications.
///
/// The host API serves this to the browser UI; tests use it to assert on
/// exactly which notifications were emitted.
#[derive(Debug, Clone)]
pub struct NotificationLog {
    entries: Arc<Mutex<VecDeque<Notification>>>,
    capacity: usize,
}

impl NotificationLog {
    pub const DEFAULT_CAPACITY: usize = 200;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<Notification> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl NotificationSink for NotificationLog {
    fn notify(&self, message: &str, severity: Severity) {
        TracingSink.notify(message, severity);
        let mut entries = self.lock();
        if entries.len() >= self.capacity.max(1) {
            entries.pop_front();
        }
        entries.push_back(Notification::new(message, severity));
    }
}

/// Shared sink handle as held by the coordinator, loader and reaper.
pub type SharedSink = Arc<dyn NotificationSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_keeps_order_and_capacity() {
        let log = NotificationLog::new(2);
        log.notify("one", Severity::Info);
        log.notify("two", Severity::Success);
        log.notify("three", Severity::Error);

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "two");
        assert_eq!(entries[1].severity, Severity::Error);
    }
}
