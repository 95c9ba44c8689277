use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::FarmStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{
  NewTaskEntry, SequenceId, ServerId, ServerNode, StatusHistoryEntry, TaskLogEntry,
};

#[derive(Default)]
struct State {
  servers: BTreeMap<ServerId, ServerNode>,
  next_server_id: ServerId,
  tasks: BTreeMap<SequenceId, TaskLogEntry>,
  last_sequence: SequenceId,
  history: Vec<StatusHistoryEntry>,
  flags: HashMap<String, bool>,
}

/// In-process store. Several nodes sharing one `Arc<MemoryStore>` behave
/// like a farm sharing one database.
#[derive(Default)]
pub struct MemoryStore {
  state: Mutex<State>,
  outage: AtomicUsize,
  status_change_failures: AtomicUsize,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes the next `calls` operations fail with `StoreError::Unavailable`.
  pub fn inject_outage(&self, calls: usize) {
    self.outage.store(calls, Ordering::SeqCst);
  }

  /// Makes only the next `calls` status-change writes fail, leaving every
  /// other operation available.
  pub fn inject_status_change_failures(&self, calls: usize) {
    self.status_change_failures.store(calls, Ordering::SeqCst);
  }

  fn check_available(&self) -> StoreResult<()> {
    take_one(&self.outage)
  }
}

fn take_one(counter: &AtomicUsize) -> StoreResult<()> {
  let failed = counter
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
    .is_ok();
  if failed {
    return Err(StoreError::Unavailable("injected outage".into()));
  }
  Ok(())
}

fn server_mut(state: &mut State, id: ServerId) -> StoreResult<&mut ServerNode> {
  state.servers.get_mut(&id).ok_or_else(|| StoreError::NotFound {
    entity: "server",
    id: id.to_string(),
  })
}

#[async_trait]
impl FarmStore for MemoryStore {
  async fn upsert_server(&self, name: &str) -> StoreResult<ServerNode> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    if let Some(existing) = state.servers.values().find(|s| s.name == name) {
      return Ok(existing.clone());
    }
    state.next_server_id += 1;
    let server = ServerNode::new(state.next_server_id, name);
    state.servers.insert(server.id, server.clone());
    Ok(server)
  }

  async fn get_server(&self, id: ServerId) -> StoreResult<Option<ServerNode>> {
    self.check_available()?;
    Ok(self.state.lock().await.servers.get(&id).cloned())
  }

  async fn list_servers(&self, include_disabled: bool) -> StoreResult<Vec<ServerNode>> {
    self.check_available()?;
    let state = self.state.lock().await;
    Ok(
      state
        .servers
        .values()
        .filter(|s| include_disabled || s.enabled)
        .cloned()
        .collect(),
    )
  }

  async fn update_ping(&self, id: ServerId, is_external_application: bool, at: DateTime<Utc>) -> StoreResult<()> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    let server = server_mut(&mut state, id)?;
    server.last_ping_time = Some(at);
    server.is_external_application = is_external_application;
    Ok(())
  }

  async fn set_server_enabled(&self, id: ServerId, enabled: bool) -> StoreResult<()> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    server_mut(&mut state, id)?.enabled = enabled;
    Ok(())
  }


  async fn record_checkpoint(&self, id: ServerId, sequence_id: SequenceId) -> StoreResult<()> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    let server = server_mut(&mut state, id)?;
    server.last_processed_sequence = Some(server.last_processed_sequence.map_or(sequence_id, |s| s.max(sequence_id)));
    Ok(())
  }

  async fn record_status_change(&self, entry: StatusHistoryEntry) -> StoreResult<()> {
    self.check_available()?;
    take_one(&self.status_change_failures)?;
    let mut state = self.state.lock().await;
    let server = server_mut(&mut state, entry.change.server_id)?;
    server.status = entry.change.new_status;
    server.last_status_change_time = Some(entry.change.timestamp);
    state.history.push(entry);
    Ok(())
  }

  async fn clear_status_history(&self, observer_id: ServerId) -> StoreResult<u64> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    let before = state.history.len();
    state.history.retain(|h| h.observer_id != observer_id);
    Ok((before - state.history.len()) as u64)
  }

  async fn list_status_history(&self, limit: usize) -> StoreResult<Vec<StatusHistoryEntry>> {
    self.check_available()?;
    let state = self.state.lock().await;
    Ok(state.history.iter().rev().take(limit).cloned().collect())
  }

  async fn append_task(&self, entry: NewTaskEntry) -> StoreResult<SequenceId> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    state.last_sequence += 1;
    let sequence_id = state.last_sequence;
    state.tasks.insert(sequence_id, TaskLogEntry::from_new(sequence_id, entry));
    Ok(sequence_id)
  }

  async fn read_entries_since(&self, after: SequenceId, limit: usize) -> StoreResult<Vec<TaskLogEntry>> {
    self.check_available()?;
    let state = self.state.lock().await;
    Ok(
      state
        .tasks
        .range(after.saturating_add(1)..)
        .take(limit)
        .map(|(_, entry)| entry.clone())
        .collect(),
    )
  }

  async fn max_sequence(&self) -> StoreResult<SequenceId> {
    self.check_available()?;
    Ok(self.state.lock().await.last_sequence)
  }

  async fn delete_entries_through(&self, sequence_id: SequenceId) -> StoreResult<u64> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    let kept = state.tasks.split_off(&sequence_id.saturating_add(1));
    let removed = state.tasks.len() as u64;
    state.tasks = kept;
    Ok(removed)
  }

  async fn get_flag(&self, name: &str) -> StoreResult<Option<bool>> {
    self.check_available()?;
    Ok(self.state.lock().await.flags.get(name).copied())
  }

  async fn set_flag(&self, name: &str, value: bool) -> StoreResult<()> {
    self.check_available()?;
    self.state.lock().await.flags.insert(name.to_string(), value);
    Ok(())
  }
}
