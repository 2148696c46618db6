//! File-status egress
//!
//! Publishes `(path, status)` events whenever a transition changes what a
//! file looks like from the outside. The event channel is bounded and
//! drop-oldest; consumers poll the query interface for the current status of
//! any path.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;

use onemount_core::domain::FileStatus;

/// One published status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub path: String,
    pub status: FileStatus,
}

/// Bounded drop-oldest status publisher with a current-status table.
pub struct StatusNotifier {
    table: DashMap<String, FileStatus>,
    queue: Mutex<VecDeque<StatusEvent>>,
    capacity: usize,
}

impl StatusNotifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            table: DashMap::new(),
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Publishes a status change. No-ops when the externally observable
    /// status did not actually change.
    pub fn emit(&self, path: impl Into<String>, status: FileStatus) {
        let path = path.into();
        let changed = self
            .table
            .insert(path.clone(), status)
            .map_or(true, |prev| prev != status);
        if !changed {
            return;
        }

        tracing::trace!(path = %path, status = %status, "File status");
        let mut queue = self.queue.lock().unwrap();
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(StatusEvent { path, status });
    }

    /// Current status of a path, if any has ever been published.
    pub fn get_status(&self, path: &str) -> Option<FileStatus> {
        self.table.get(path).map(|r| *r)
    }

    /// Drains pending events in publish order (consumer poll).
    pub fn drain(&self) -> Vec<StatusEvent> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Forgets a path (unlink / purge).
    pub fn forget(&self, path: &str) {
        self.table.remove(path);
    }
}
