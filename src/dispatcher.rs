use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{FarmError, FarmResult};
use crate::inbox::TaskInbox;
use crate::models::{NewTaskEntry, SequenceId, ServerId, TaskTarget};
use crate::server_registry::ServerRegistry;
use crate::store::FLAG_FARM_ENABLED;
use crate::task_log::TaskLog;
use crate::task_types::{TaskArgs, TaskTypeRegistry};

/// Write side of the farm: announces a mutation this node already applied
/// so that every other node applies it too.
#[derive(Clone)]
pub struct Dispatcher {
  server_id: ServerId,
  task_types: Arc<TaskTypeRegistry>,
  registry: ServerRegistry,
  log: TaskLog,
  inbox: Option<TaskInbox>,
}

impl Dispatcher {
  pub fn new(
    server_id: ServerId,
    task_types: Arc<TaskTypeRegistry>,
    registry: ServerRegistry,
    log: TaskLog,
    inbox: Option<TaskInbox>,
  ) -> Self {
    Self {
      server_id,
      task_types,
      registry,
      log,
      inbox,
    }
  }

  pub fn server_id(&self) -> ServerId {
    self.server_id
  }

  /// Appends one task for the other nodes. The caller must already have
  /// applied the mutation locally; the entry is never executed on this node.
  ///
  /// Returns `None` when nothing was appended because farm synchronization
  /// is disabled or no other enabled node exists.
  pub async fn broadcast(
    &self,
    type_name: &str,
    target: TaskTarget,
    text_parameters: Vec<String>,
    binary_payload: Option<Vec<u8>>,
  ) -> FarmResult<Option<SequenceId>> {
    let registration = self
      .task_types
      .lookup(type_name)
      .ok_or_else(|| FarmError::UnregisteredTaskType(type_name.to_string()))?;

    let farm_enabled = self
      .registry
      .store()
      .get_flag(FLAG_FARM_ENABLED)
      .await?
      .unwrap_or(true);
    if !farm_enabled {
      debug!(type_name, "Farm synchronization disabled, task not broadcast");
      return Ok(None);
    }

    let servers = self.registry.list_servers(false).await?;
    match target {
      TaskTarget::Server(id) if id == self.server_id => {
        return Err(FarmError::InvalidTarget(format!("server {} is the caller itself", id)));
      }
      TaskTarget::Server(id) if !servers.iter().any(|s| s.id == id) => {
        return Err(FarmError::InvalidTarget(format!("server {} is unknown or disabled", id)));
      }
      TaskTarget::Server(_) => {}
      TaskTarget::AllServers => {
        if !servers.iter().any(|s| s.id != self.server_id) {
          debug!(type_name, "No other enabled servers, task not broadcast");
          return Ok(None);
        }
      }
    }

    let entry = self
      .log
      .append(NewTaskEntry {
        origin_server_id: self.server_id,
        type_name: type_name.to_string(),
        target,
        text_parameters,
        binary_payload,
        created_at: Utc::now(),
      })
      .await?;

    if registration.is_memory_task {
      if let Some(inbox) = &self.inbox {
        inbox.push(&entry);
      }
    }

    info!(
      sequence_id = entry.sequence_id,
      type_name,
      target = %target,
      "Task broadcast"
    );
    Ok(Some(entry.sequence_id))
  }

  /// Runs the local handler, then broadcasts the same task. A failing local
  /// handler aborts the broadcast.
  pub async fn apply_and_broadcast(
    &self,
    type_name: &str,
    target: TaskTarget,
    text_parameters: Vec<String>,
    binary_payload: Option<Vec<u8>>,
  ) -> anyhow::Result<Option<SequenceId>> {
    let args = TaskArgs {
      target,
      text_parameters: &text_parameters,
      binary_payload: binary_payload.as_deref(),
    };
    if let Err(e) = self.task_types.apply_locally(type_name, args)? {
      warn!(type_name, "Local application failed, not broadcasting: {:#}", e);
      return Err(e);
    }
    Ok(self.broadcast(type_name, target, text_parameters, binary_payload).await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{FarmStore, MemoryStore};
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Fixture {
    store: Arc<MemoryStore>,
    dispatcher: Dispatcher,
    other: ServerId,
  }

  async fn fixture(task_types: TaskTypeRegistry, inbox: Option<TaskInbox>) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let registry = ServerRegistry::new(store.clone());
    let me = registry.register_or_get_server("web-a").await.unwrap();
    let other = registry.register_or_get_server("web-b").await.unwrap();
    let dispatcher = Dispatcher::new(
      me.id,
      Arc::new(task_types),
      registry,
      TaskLog::new(store.clone()),
      inbox,
    );
    Fixture {
      store,
      dispatcher,
      other: other.id,
    }
  }

  fn types() -> TaskTypeRegistry {
    let mut types = TaskTypeRegistry::new();
    types.register("Settings.Invalidate", true, |_| Ok(())).unwrap();
    types.register("Files.Write", false, |_| Ok(())).unwrap();
    types
  }

  #[tokio::test]
  async fn broadcast_appends_one_stamped_entry() {
    let f = fixture(types(), None).await;
    let seq = f
      .dispatcher
      .broadcast("Files.Write", TaskTarget::AllServers, vec!["a.txt".into()], Some(b"hi".to_vec()))
      .await
      .unwrap()
      .unwrap();
    let entries = f.store.read_entries_since(0, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sequence_id, seq);
    assert_eq!(entries[0].origin_server_id, f.dispatcher.server_id());
    assert_eq!(entries[0].binary_payload.as_deref(), Some(&b"hi"[..]));
  }

  #[tokio::test]
  async fn unregistered_types_cannot_be_broadcast() {
    let f = fixture(types(), None).await;
    let err = f
      .dispatcher
      .broadcast("ClearFoo", TaskTarget::AllServers, vec![], None)
      .await
      .unwrap_err();
    assert!(matches!(err, FarmError::UnregisteredTaskType(_)));
    assert_eq!(f.store.max_sequence().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn targets_are_checked() {
    let f = fixture(types(), None).await;
    let me = f.dispatcher.server_id();
    assert!(matches!(
      f.dispatcher.broadcast("Files.Write", TaskTarget::Server(me), vec![], None).await,
      Err(FarmError::InvalidTarget(_))
    ));
    assert!(matches!(
      f.dispatcher.broadcast("Files.Write", TaskTarget::Server(999), vec![], None).await,
      Err(FarmError::InvalidTarget(_))
    ));
    f.store.set_server_enabled(f.other, false).await.unwrap();
    assert!(matches!(
      f.dispatcher.broadcast("Files.Write", TaskTarget::Server(f.other), vec![], None).await,
      Err(FarmError::InvalidTarget(_))
    ));
  }

  #[tokio::test]
  async fn nothing_is_appended_without_peers_or_when_disabled() {
    let f = fixture(types(), None).await;
    f.store.set_server_enabled(f.other, false).await.unwrap();
    assert_eq!(
      f.dispatcher.broadcast("Files.Write", TaskTarget::AllServers, vec![], None).await.unwrap(),
      None
    );

    f.store.set_server_enabled(f.other, true).await.unwrap();
    f.store.set_flag(FLAG_FARM_ENABLED, false).await.unwrap();
    assert_eq!(
      f.dispatcher.broadcast("Files.Write", TaskTarget::AllServers, vec![], None).await.unwrap(),
      None
    );
    assert_eq!(f.store.max_sequence().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn memory_tasks_are_pushed_to_the_inbox() {
    let inbox = TaskInbox::new();
    let mut rx = inbox.subscribe();
    let f = fixture(types(), Some(inbox)).await;
    let seq = f
      .dispatcher
      .broadcast("Settings.Invalidate", TaskTarget::AllServers, vec!["k".into()], None)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(rx.try_recv().unwrap().sequence_id, seq);

    f.dispatcher
      .broadcast("Files.Write", TaskTarget::AllServers, vec![], None)
      .await
      .unwrap();
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn apply_and_broadcast_runs_locally_first() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let mut task_types = TaskTypeRegistry::new();
    task_types
      .register("Settings.Invalidate", true, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
      })
      .unwrap();
    task_types
      .register("Broken", true, |_| Err(anyhow::anyhow!("boom")))
      .unwrap();
    let f = fixture(task_types, None).await;

    let seq = f
      .dispatcher
      .apply_and_broadcast("Settings.Invalidate", TaskTarget::AllServers, vec![], None)
      .await
      .unwrap();
    assert!(seq.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(f.dispatcher.apply_and_broadcast("Broken", TaskTarget::AllServers, vec![], None).await.is_err());
    assert_eq!(f.store.max_sequence().await.unwrap(), 1);
  }
}
