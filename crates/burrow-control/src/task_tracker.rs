//! Background tasks owned by a tunnel
//!
//! Each tunnel may own a task (typically its backend listener). The task is
//! aborted when the tunnel is removed or the relay shuts down.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::debug;

pub struct TaskTracker {
    /// client_id -> task handle
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a task to a tunnel, aborting any task it replaces
    pub fn register(&self, client_id: impl Into<String>, handle: JoinHandle<()>) {
        let client_id = client_id.into();
        if let Some(previous) = self.lock().insert(client_id.clone(), handle) {
            debug!(client_id = %client_id, "Replacing tunnel task");
            previous.abort();
        }
    }

    /// Abort and forget the task attached to a tunnel
    pub fn unregister(&self, client_id: &str) {
        if let Some(handle) = self.lock().remove(client_id) {
            debug!(client_id = %client_id, "Aborting tunnel task");
            handle.abort();
        }
    }

    #[cfg(test)]
    fn contains(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    /// Abort every tracked task
    pub fn abort_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (client_id, handle) in drained {
            debug!(client_id = %client_id, "Aborting tunnel task");
            handle.abort();
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
