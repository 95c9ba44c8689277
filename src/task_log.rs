use std::sync::Arc;

use tracing::{debug, info};

use crate::error::StoreResult;
use crate::models::{NewTaskEntry, SequenceId, ServerNode, TaskLogEntry};
use crate::store::FarmStore;

/// Append-only, globally ordered log of broadcast tasks.
#[derive(Clone)]
pub struct TaskLog {
  store: Arc<dyn FarmStore>,
}

impl TaskLog {
  pub fn new(store: Arc<dyn FarmStore>) -> Self {
    Self { store }
  }

  pub async fn append(&self, entry: NewTaskEntry) -> StoreResult<TaskLogEntry> {
    let sequence_id = self.store.append_task(entry.clone()).await?;
    debug!(sequence_id, type_name = %entry.type_name, "Task appended to log");
    Ok(TaskLogEntry::from_new(sequence_id, entry))
  }

  pub async fn read_since(&self, after: SequenceId, limit: usize) -> StoreResult<Vec<TaskLogEntry>> {
    self.store.read_entries_since(after, limit).await
  }

  pub async fn high_water_mark(&self) -> StoreResult<SequenceId> {
    self.store.max_sequence().await
  }

  /// Deletes entries every enabled node has already processed, including
  /// nodes that are currently down and will resume from their checkpoint.
  /// Returns the number of deleted entries.
  pub async fn collect_garbage(&self) -> StoreResult<u64> {
    let servers = self.store.list_servers(false).await?;
    let Some(horizon) = gc_horizon(&servers) else {
      return Ok(0);
    };
    let deleted = self.store.delete_entries_through(horizon).await?;
    if deleted > 0 {
      info!(horizon, deleted, "Collected processed task log entries");
    }
    Ok(deleted)
  }
}

/// Lowest recorded checkpoint among enabled nodes, live or not. Nodes that
/// never recorded one have not started consuming and will begin at the
/// high-water mark. Disabled nodes fast-forward and are ignored.
pub fn gc_horizon(servers: &[ServerNode]) -> Option<SequenceId> {
  servers
    .iter()
    .filter(|s| s.enabled)
    .filter_map(|s| s.last_processed_sequence)
    .min()
}
