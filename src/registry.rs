//! # Task Registry - In-Flight Task Bookkeeping
//!
//! Thread-safe, in-memory map of [`ScheduledTask`] entries keyed by
//! [`TaskId`]. The registry serves two purposes:
//!
//! - **Idempotency**: [`insert_if_absent`](TaskRegistry::insert_if_absent) is
//!   the atomic check that makes dispatch at-most-once per task id.
//! - **Introspection**: non-terminal counts and per-run views for
//!   observability and cancellation.
//!
//! ## 🔒 Thread Safety
//!
//! The map is a `HashMap` behind `Arc<RwLock<_>>`: concurrent readers, one
//! writer. Every mutation is atomic per key; status transitions are checked
//! against the one-directional status machine under the write lock, so two
//! racing callbacks cannot both move the same entry. Lock poisoning surfaces
//! as a [`RedriveError::Registry`] instead of a panic.
//!
//! No mutation holds the lock across an await point; all methods here are
//! synchronous and cheap.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{RedriveError, RedriveResult};
use crate::task::{ScheduledTask, TaskId, TaskStatus};

/// Thread-safe registry of in-flight and recently-terminal tasks.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    entries: Arc<RwLock<HashMap<TaskId, ScheduledTask>>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register an entry unless its task id is already present.
    ///
    /// Returns `true` if the entry was inserted, `false` if an entry with the
    /// same id already existed. This is the at-most-once dispatch gate.
    pub fn insert_if_absent(&self, entry: ScheduledTask) -> RedriveResult<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RedriveError::registry("Failed to acquire write lock on registry"))?;

        if entries.contains_key(&entry.task_id) {
            return Ok(false);
        }
        entries.insert(entry.task_id.clone(), entry);
        Ok(true)
    }

    /// Fetch a snapshot of an entry.
    pub fn get(&self, task_id: &TaskId) -> RedriveResult<Option<ScheduledTask>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RedriveError::registry("Failed to acquire read lock on registry"))?;
        Ok(entries.get(task_id).cloned())
    }

    /// Move an entry to a new status if the status machine permits it.
    ///
    /// Terminal targets stamp `completed_at`; a failure message can be
    /// attached for `Failed`. Returns `true` if the transition was applied,
    /// `false` if the entry is missing or the transition is illegal.
    pub fn transition(
        &self,
        task_id: &TaskId,
        to: TaskStatus,
        error: Option<String>,
    ) -> RedriveResult<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RedriveError::registry("Failed to acquire write lock on registry"))?;

        let Some(entry) = entries.get_mut(task_id) else {
            return Ok(false);
        };
        if !entry.status.can_transition_to(to) {
            debug!(
                task_id = %task_id,
                from = %entry.status,
                to = %to,
                "Ignoring illegal status transition"
            );
            return Ok(false);
        }

        entry.status = to;
        if to.is_terminal() {
            entry.completed_at = Some(Utc::now());
        }
        if let Some(message) = error {
            entry.error = Some(message);
        }
        Ok(true)
    }

    /// Best-effort cancellation of every non-terminal entry for a run.
    ///
    /// Only updates local bookkeeping; an already-dispatched executor is not
    /// stopped (cooperative cancellation is the executor's concern). Returns
    /// how many entries were cancelled.
    pub fn cancel_run(&self, run_id: &str) -> RedriveResult<usize> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RedriveError::registry("Failed to acquire write lock on registry"))?;

        let mut cancelled = 0;
        for entry in entries.values_mut() {
            if entry.task.run_id == run_id && entry.status.can_transition_to(TaskStatus::Cancelled)
            {
                entry.status = TaskStatus::Cancelled;
                entry.completed_at = Some(Utc::now());
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Count of entries not yet in a terminal state.
    pub fn active_count(&self) -> RedriveResult<usize> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RedriveError::registry("Failed to acquire read lock on registry"))?;
        Ok(entries.values().filter(|e| !e.status.is_terminal()).count())
    }

    /// Total entry count, terminal included.
    pub fn len(&self) -> RedriveResult<usize> {
        let entries = self
            .entries
            .read()
            .map_err(|_| RedriveError::registry("Failed to acquire read lock on registry"))?;
        Ok(entries.len())
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> RedriveResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Prune terminal entries whose terminal timestamp is before `cutoff`.
    ///
    /// Non-terminal entries are never pruned, regardless of age. Returns how
    /// many entries were removed.
    pub fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> RedriveResult<usize> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| RedriveError::registry("Failed to acquire write lock on registry"))?;

        let before = entries.len();
        entries.retain(|_, entry| {
            !(entry.status.is_terminal() && entry.age_reference() < cutoff)
        });
        Ok(before - entries.len())
    }
}
