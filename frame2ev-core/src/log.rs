//! Shared, append-only event log.

use crate::types::Event;
use std::sync::{Arc, Mutex, MutexGuard};

/// Ordered, append-only sequence of events for one session.
///
/// Cloning the log clones the handle, not the events: the engine appends
/// through one handle while exporters read through another. Readers never see
/// the live vector, only a [`snapshot`](EventLog::snapshot) copy, so an export
/// cannot observe a half-appended batch.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning is ignored: every append is a single `extend_from_slice`.
    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a batch of events atomically.
    pub fn extend(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        self.lock().extend_from_slice(events);
    }

    /// Returns the number of logged events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no event has been logged.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies the current contents.
    ///
    /// The lock is released before this returns.
    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().clone()
    }
}
