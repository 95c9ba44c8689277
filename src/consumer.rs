//! Read side of the farm: replays other nodes' tasks in log order.
//!
//! Every entry past the checkpoint is either executed or skipped, and the
//! checkpoint moves past it either way. A failing or panicking handler is
//! logged and does not hold the node back; handlers are idempotent and the
//! next invalidation of the same kind repairs whatever it left stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::{MemoryReplayPolicy, SyncSettings};
use crate::error::{StoreError, StoreResult};
use crate::inbox::TaskInbox;
use crate::models::{SequenceId, ServerId, ServerNode, ServerStatus, TaskLogEntry};
use crate::monitor::MonitorState;
use crate::server_registry::ServerRegistry;
use crate::task_log::TaskLog;
use crate::task_types::{TaskArgs, TaskTypeRegistration, TaskTypeRegistry};

/// Highest sequence id this node has finished with. Only the node's own
/// consumer writes it, and it never moves backwards.
#[derive(Debug)]
pub struct NodeCheckpoint {
  last_processed: AtomicI64,
}

impl NodeCheckpoint {
  pub fn new(sequence_id: SequenceId) -> Self {
    Self {
      last_processed: AtomicI64::new(sequence_id),
    }
  }

  pub fn get(&self) -> SequenceId {
    self.last_processed.load(Ordering::Acquire)
  }

  pub fn advance(&self, sequence_id: SequenceId) {
    self.last_processed.fetch_max(sequence_id, Ordering::AcqRel);
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumeReport {
  pub applied: usize,
  pub failed: usize,
  pub unknown_type: usize,
  pub skipped_own: usize,
  pub skipped_not_targeted: usize,
  pub skipped_memory: usize,
  pub skipped_disabled: usize,
}

impl ConsumeReport {
  pub fn processed(&self) -> usize {
    self.applied
      + self.failed
      + self.unknown_type
      + self.skipped_own
      + self.skipped_not_targeted
      + self.skipped_memory
      + self.skipped_disabled
  }
}

pub struct TaskConsumer {
  server_id: ServerId,
  task_types: Arc<TaskTypeRegistry>,
  registry: ServerRegistry,
  log: TaskLog,
  settings: SyncSettings,
  checkpoint: NodeCheckpoint,
  process_started_at: DateTime<Utc>,
  /// Last heartbeat of this node's previous run, read before this run pinged.
  previous_last_ping: Option<DateTime<Utc>>,
  inbox: Option<TaskInbox>,
}

impl TaskConsumer {
  /// Builds the consumer from this node's registry row as it was before the
  /// current process pinged. A node that recorded a checkpoint in an earlier
  /// run resumes from it so durable tasks are replayed; otherwise it starts
  /// at the log's high-water mark.
  pub async fn bootstrap(
    own: &ServerNode,
    task_types: Arc<TaskTypeRegistry>,
    registry: ServerRegistry,
    log: TaskLog,
    settings: SyncSettings,
    process_started_at: DateTime<Utc>,
    inbox: Option<TaskInbox>,
  ) -> StoreResult<Self> {
    let start = match own.last_processed_sequence {
      Some(recorded) if settings.resume_from_checkpoint => recorded,
      _ => log.high_water_mark().await?,
    };
    // persisted right away so a restart before the first entry still resumes here
    if own.last_processed_sequence != Some(start) {
      registry.store().record_checkpoint(own.id, start).await?;
    }
    info!(server_id = own.id, checkpoint = start, "Task consumer starting");
    Ok(Self {
      server_id: own.id,
      task_types,
      registry,
      log,
      settings,
      checkpoint: NodeCheckpoint::new(start),
      process_started_at,
      previous_last_ping: own.last_ping_time,
      inbox,
    })
  }

  pub fn server_id(&self) -> ServerId {
    self.server_id
  }

  pub fn checkpoint(&self) -> SequenceId {
    self.checkpoint.get()
  }

  /// Drains the log past the checkpoint.
  pub async fn poll_once(&self) -> StoreResult<ConsumeReport> {
    let own = self
      .registry
      .store()
      .get_server(self.server_id)
      .await?
      .ok_or_else(|| StoreError::NotFound {
        entity: "server",
        id: self.server_id.to_string(),
      })?;

    let batch_size = self.settings.batch_size.max(1);
    let mut report = ConsumeReport::default();
    loop {
      let batch = self.log.read_since(self.checkpoint.get(), batch_size).await?;
      let exhausted = batch.len() < batch_size;
      for entry in batch {
        let sequence_id = entry.sequence_id;
        self.process(entry, own.enabled, &mut report).await;
        self.checkpoint.advance(sequence_id);
      }
      if exhausted {
        break;
      }
    }

    if report.processed() > 0 {
      debug!(server_id = self.server_id, checkpoint = self.checkpoint.get(), ?report, "Consumed task log");
      if let Err(e) = self
        .registry
        .store()
        .record_checkpoint(self.server_id, self.checkpoint.get())
        .await
      {
        warn!(server_id = self.server_id, "Could not record checkpoint: {}", e);
      }
    }
    Ok(report)
  }

  async fn process(&self, entry: TaskLogEntry, enabled: bool, report: &mut ConsumeReport) {
    if entry.origin_server_id == self.server_id {
      report.skipped_own += 1;
      return;
    }
    if !entry.target.includes(self.server_id) {
      report.skipped_not_targeted += 1;
      return;
    }
    if !enabled {
      report.skipped_disabled += 1;
      return;
    }
    let Some(registration) = self.task_types.lookup(&entry.type_name) else {
      warn!(
        sequence_id = entry.sequence_id,
        type_name = %entry.type_name,
        "No local handler for task type, skipping"
      );
      report.unknown_type += 1;
      return;
    };
    if registration.is_memory_task && self.missed_while_offline(entry.created_at) {
      debug!(
        sequence_id = entry.sequence_id,
        type_name = %entry.type_name,
        "Memory task predates this process, skipping"
      );
      report.skipped_memory += 1;
      return;
    }

    if self.execute(registration, entry).await {
      report.applied += 1;
    } else {
      report.failed += 1;
    }
  }

  /// True when a memory task created at `created_at` only touched state this
  /// process never had: it predates the process and this node was offline.
  fn missed_while_offline(&self, created_at: DateTime<Utc>) -> bool {
    match self.settings.memory_replay {
      MemoryReplayPolicy::ReplayAll => false,
      MemoryReplayPolicy::SkipWhileOffline => {
        created_at < self.process_started_at
          && ServerStatus::from_ping(self.previous_last_ping, created_at, self.settings.offline_timeout)
            != ServerStatus::Online
      }
    }
  }

  async fn execute(&self, registration: &TaskTypeRegistration, entry: TaskLogEntry) -> bool {
    let sequence_id = entry.sequence_id;
    let target = entry.target;
    let type_name = entry.type_name.clone();
    let handler = registration.handler.clone();

    let outcome = tokio::task::spawn_blocking(move || {
      handler(TaskArgs {
        target: entry.target,
        text_parameters: &entry.text_parameters,
        binary_payload: entry.binary_payload.as_deref(),
      })
    })
      .await;

    match outcome {
      Ok(Ok(())) => {
        debug!(sequence_id, type_name = %type_name, "Task applied");
        true
      }
      Ok(Err(e)) => {
        error!(sequence_id, type_name = %type_name, target = %target, "Task handler failed: {:#}", e);
        false
      }
      Err(e) => {
        error!(sequence_id, type_name = %type_name, target = %target, "Task handler panicked: {}", e);
        false
      }
    }
  }

  /// Polls on every tick and whenever a memory task is pushed to the inbox.
  /// Waits while the monitor is initializing and exits once it has stopped.
  pub async fn run(
    self: Arc<Self>,
    mut monitor_state: watch::Receiver<MonitorState>,
    mut shutdown: watch::Receiver<bool>,
  ) {
    let mut ticker = interval(self.settings.consumer_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pushed = self.inbox.as_ref().map(TaskInbox::subscribe);
    let mut ticks: u64 = 0;

    loop {
      tokio::select! {
        _ = ticker.tick() => {}
        Some(sequence_id) = next_pushed(&mut pushed) => {
          debug!(server_id = self.server_id, sequence_id, "Woken by pushed task");
        }
        _ = shutdown.changed() => break,
      }
      if *shutdown.borrow() {
        break;
      }

      let state = *monitor_state.borrow_and_update();
      match state {
        MonitorState::Initializing => continue,
        MonitorState::Stopped => {
          info!(server_id = self.server_id, "Health monitor stopped, task consumer stopping");
          break;
        }
        MonitorState::Running => {}
      }

      if let Err(e) = self.poll_once().await {
        warn!(server_id = self.server_id, "Task log poll failed, retrying next tick: {}", e);
      }

      ticks += 1;
      let gc_every = self.settings.gc_every_ticks;
      if gc_every > 0 && ticks % gc_every == 0 {
        if let Err(e) = self.log.collect_garbage().await {
          warn!(server_id = self.server_id, "Task log GC failed: {}", e);
        }
      }
    }
    info!(server_id = self.server_id, checkpoint = self.checkpoint.get(), "Task consumer exited");
  }
}

async fn next_pushed(inbox: &mut Option<broadcast::Receiver<TaskLogEntry>>) -> Option<SequenceId> {
  let Some(receiver) = inbox.as_mut() else {
    return std::future::pending().await;
  };
  match receiver.recv().await {
    Ok(entry) => Some(entry.sequence_id),
    Err(RecvError::Lagged(skipped)) => {
      debug!(skipped, "Inbox lagged, regular poll will catch up");
      None
    }
    Err(RecvError::Closed) => {
      *inbox = None;
      None
    }
  }
}
