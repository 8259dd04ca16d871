//! Deferred write replay for actions that failed while offline.
//!
//! The queue does not schedule its own retries; it only guarantees that a
//! drain is safe to trigger any number of times. Connectivity-restored events
//! and periodic ticks both call it.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Replay task states. `Done` and `Failed` are transient: a finished task is
/// removed, a failed one goes back to `Pending` for the next drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  Syncing,
  Done,
  Failed,
}

/// One deferred write: what to send, where, and how it has fared so far.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayTask {
  pub id: u64,
  /// Sync tag the foreground registered this task under.
  pub tag: String,
  pub endpoint: String,
  pub payload: serde_json::Value,
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
}

/// Success/failure accounting for one drain pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DrainReport {
  pub sent: usize,
  pub failed: usize,
}

/// Queue of writes to replay once connectivity returns.
///
/// The mutex is never held across an await: a drain snapshots the pending
/// tasks, sends outside the lock, then reconciles.
pub struct ReplayQueue {
  tasks: Mutex<Vec<ReplayTask>>,
  next_id: AtomicU64,
}

impl ReplayQueue {
  pub fn new() -> Self {
    Self {
      tasks: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<ReplayTask>>> {
    self.tasks.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Record a failed write for later replay. Returns the task id.
  pub fn register(&self, tag: String, endpoint: String, payload: serde_json::Value) -> Result<u64> {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let task = ReplayTask {
      id,
      tag: tag.clone(),
      endpoint,
      payload,
      status: TaskStatus::Pending,
      created_at: Utc::now(),
      attempts: 0,
    };

    self.lock()?.push(task);
    info!(id, tag = %tag, "Registered replay task");
    Ok(id)
  }

  /// Explicitly cancel a task. Returns whether it existed.
  #[allow(dead_code)]
  pub fn cancel(&self, id: u64) -> Result<bool> {
    let mut tasks = self.lock()?;
    let before = tasks.len();
    tasks.retain(|t| t.id != id);
    Ok(tasks.len() < before)
  }

  pub fn pending_count(&self) -> Result<usize> {
    Ok(
      self
        .lock()?
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .count(),
    )
  }

  /// Snapshot of all queued tasks.
  pub fn tasks(&self) -> Result<Vec<ReplayTask>> {
    Ok(self.lock()?.clone())
  }

  /// Send every pending task to its endpoint.
  ///
  /// Tasks are sent concurrently and independently: one failure never blocks
  /// the rest of the pass. Successes are deleted; failures return to
  /// `Pending` with their attempt count bumped. Draining again with nothing
  /// new queued sends nothing.
  pub async fn drain<F, Fut>(&self, send: F) -> Result<DrainReport>
  where
    F: Fn(ReplayTask) -> Fut,
    Fut: Future<Output = Result<()>>,
  {
    let batch: Vec<ReplayTask> = {
      let mut tasks = self.lock()?;
      tasks
        .iter_mut()
        .filter(|t| t.status == TaskStatus::Pending)
        .map(|t| {
          t.status = TaskStatus::Syncing;
          t.clone()
        })
        .collect()
    };

    if batch.is_empty() {
      return Ok(DrainReport::default());
    }
    debug!(tasks = batch.len(), "Draining replay queue");

    let results = join_all(batch.into_iter().map(|task| {
      let id = task.id;
      let fut = send(task);
      async move { (id, fut.await) }
    }))
    .await;

    let mut report = DrainReport::default();
    let mut tasks = self.lock()?;
    for (id, result) in results {
      match result {
        Ok(()) => {
          report.sent += 1;
          tasks.retain(|t| t.id != id);
        }
        Err(e) => {
          report.failed += 1;
          if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
            warn!(id, tag = %task.tag, error = %e, "Replay failed; task stays pending");
            task.status = TaskStatus::Pending;
            task.attempts += 1;
          }
        }
      }
    }

    Ok(report)
  }
}

impl Default for ReplayQueue {
  fn default() -> Self {
    Self::new()
  }
}
