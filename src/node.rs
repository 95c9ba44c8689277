use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, SyncSettings};
use crate::consumer::TaskConsumer;
use crate::dispatcher::Dispatcher;
use crate::error::FarmResult;
use crate::inbox::TaskInbox;
use crate::models::{ServerId, ServerNode, StatusChange};
use crate::monitor::HealthMonitor;
use crate::server_registry::ServerRegistry;
use crate::store::FarmStore;
use crate::task_log::TaskLog;
use crate::task_types::TaskTypeRegistry;

#[derive(Debug, Clone)]
pub struct NodeOptions {
  pub server_name: String,
  pub is_external_application: bool,
  pub external_app_configured: bool,
  pub settings: SyncSettings,
}

impl NodeOptions {
  pub fn new(server_name: impl Into<String>) -> Self {
    Self {
      server_name: server_name.into(),
      is_external_application: false,
      external_app_configured: false,
      settings: SyncSettings::default(),
    }
  }
}

impl From<&Config> for NodeOptions {
  fn from(config: &Config) -> Self {
    Self {
      server_name: config.server_name.clone(),
      is_external_application: config.is_external_application,
      external_app_configured: config.external_app_configured,
      settings: config.sync.clone(),
    }
  }
}

/// One running farm member: its monitor and consumer loops plus the
/// dispatcher foreground code broadcasts through.
pub struct FarmNode {
  instance_id: Uuid,
  server: ServerNode,
  settings: SyncSettings,
  registry: ServerRegistry,
  log: TaskLog,
  task_types: Arc<TaskTypeRegistry>,
  dispatcher: Dispatcher,
  monitor: Arc<HealthMonitor>,
  consumer: Arc<TaskConsumer>,
  shutdown: watch::Sender<bool>,
  handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FarmNode {
  /// Joins the farm and spawns the background loops. `task_types` must hold
  /// every registration this node will ever make.
  pub async fn start(
    store: Arc<dyn FarmStore>,
    options: NodeOptions,
    task_types: TaskTypeRegistry,
    inbox: Option<TaskInbox>,
  ) -> FarmResult<Self> {
    let started_at = Utc::now();
    let instance_id = Uuid::new_v4();
    let registry = ServerRegistry::new(store.clone());
    let log = TaskLog::new(store);
    let task_types = Arc::new(task_types);

    // read before the first ping: the consumer needs last run's heartbeat
    let server = registry.register_or_get_server(&options.server_name).await?;

    let consumer = Arc::new(
      TaskConsumer::bootstrap(
        &server,
        task_types.clone(),
        registry.clone(),
        log.clone(),
        options.settings.clone(),
        started_at,
        inbox.clone(),
      )
      .await?,
    );

    let monitor = Arc::new(HealthMonitor::new(
      server.id,
      options.is_external_application,
      options.external_app_configured,
      registry.clone(),
      options.settings.clone(),
    ));
    if let Err(e) = monitor.initialize(Utc::now()).await {
      warn!(server_id = server.id, "Initial monitor pass failed, monitor loop will retry: {}", e);
    }

    let dispatcher = Dispatcher::new(server.id, task_types.clone(), registry.clone(), log.clone(), inbox);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let handles = vec![
      tokio::spawn(monitor.clone().run(shutdown_rx.clone())),
      tokio::spawn(consumer.clone().run(monitor.watch_state(), shutdown_rx)),
    ];

    info!(
      server_id = server.id,
      %instance_id,
      task_types = ?task_types.type_names(),
      "Farm node '{}' started",
      server.name
    );

    Ok(Self {
      instance_id,
      server,
      settings: options.settings,
      registry,
      log,
      task_types,
      dispatcher,
      monitor,
      consumer,
      shutdown,
      handles: Mutex::new(handles),
    })
  }

  pub fn instance_id(&self) -> Uuid {
    self.instance_id
  }

  pub fn server_id(&self) -> ServerId {
    self.server.id
  }

  pub fn server_name(&self) -> &str {
    &self.server.name
  }

  pub fn settings(&self) -> &SyncSettings {
    &self.settings
  }

  pub fn registry(&self) -> &ServerRegistry {
    &self.registry
  }

  pub fn task_log(&self) -> &TaskLog {
    &self.log
  }

  pub fn task_types(&self) -> &Arc<TaskTypeRegistry> {
    &self.task_types
  }

  pub fn dispatcher(&self) -> &Dispatcher {
    &self.dispatcher
  }

  pub fn monitor(&self) -> &Arc<HealthMonitor> {
    &self.monitor
  }

  pub fn consumer(&self) -> &Arc<TaskConsumer> {
    &self.consumer
  }

  pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
    self.monitor.subscribe()
  }

  /// Signals both loops and waits for them to exit.
  pub async fn shutdown(&self) {
    let _ = self.shutdown.send(true);
    let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
    for handle in handles {
      if let Err(e) = handle.await {
        warn!(server_id = self.server.id, "Background loop ended abnormally: {}", e);
      }
    }
    info!(server_id = self.server.id, "Farm node '{}' stopped", self.server.name);
  }
}
