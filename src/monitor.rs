//! Health monitor: heartbeat writer and status-transition detector.
//!
//! One monitor runs per node. Each tick it pings the registry for its own
//! server, recomputes the status of every other enabled server from its ping
//! age, and raises a `StatusChange` for each server whose computed status
//! differs from the last persisted one. The new status and its history row
//! are written together before the event is raised, so a transition fires
//! once rather than once per tick, and a failed write leaves the old status
//! for the next tick to compare against.
//!
//! Lifecycle is `Initializing -> Running -> Stopped`. `Stopped` is terminal
//! and is entered when farm synchronization is switched off.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::error::StoreResult;
use crate::models::{ServerId, ServerStatus, StatusChange, StatusHistoryEntry};
use crate::server_registry::{ServerRegistry, compute_status};
use crate::store::{FLAG_EXTERNAL_APP_CONFIGURED, FLAG_FARM_ENABLED};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
  Initializing,
  Running,
  Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
  Continue(Vec<StatusChange>),
  Stop,
}

pub struct HealthMonitor {
  server_id: ServerId,
  is_external_application: bool,
  external_app_configured: bool,
  registry: ServerRegistry,
  settings: SyncSettings,
  state: watch::Sender<MonitorState>,
  events: broadcast::Sender<StatusChange>,
}

impl HealthMonitor {
  pub fn new(
    server_id: ServerId,
    is_external_application: bool,
    external_app_configured: bool,
    registry: ServerRegistry,
    settings: SyncSettings,
  ) -> Self {
    let (state, _) = watch::channel(MonitorState::Initializing);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      server_id,
      is_external_application,
      external_app_configured,
      registry,
      settings,
      state,
      events,
    }
  }

  pub fn server_id(&self) -> ServerId {
    self.server_id
  }

  pub fn state(&self) -> MonitorState {
    *self.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
    self.state.subscribe()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
    self.events.subscribe()
  }

  fn set_state(&self, state: MonitorState) {
    let previous = self.state.send_replace(state);
    if previous != state {
      info!(server_id = self.server_id, "Health monitor {:?} -> {:?}", previous, state);
    }
  }

  /// Clears the history this node left behind in a previous run and pings,
  /// then moves to `Running`. The node's own stored status is left to its
  /// peers, whose next tick reports the recovery as a transition.
  pub async fn initialize(&self, now: DateTime<Utc>) -> StoreResult<()> {
    let cleared = self.registry.store().clear_status_history(self.server_id).await?;
    if cleared > 0 {
      debug!(server_id = self.server_id, cleared, "Cleared stale monitoring history");
    }
    self.registry.ping(self.server_id, self.is_external_application, now).await?;
    self.set_state(MonitorState::Running);
    Ok(())
  }

  /// One monitoring pass. Store failures are returned; the caller retries on
  /// the next tick.
  pub async fn tick(&self, now: DateTime<Utc>) -> StoreResult<TickOutcome> {
    if self.state() == MonitorState::Stopped {
      return Ok(TickOutcome::Stop);
    }
    let store = self.registry.store();

    self.registry.ping(self.server_id, self.is_external_application, now).await?;

    if !self.is_external_application {
      store
        .set_flag(FLAG_EXTERNAL_APP_CONFIGURED, self.external_app_configured)
        .await?;
    }

    let mut transitions = Vec::new();
    for server in self.registry.list_servers(false).await? {
      if server.id == self.server_id {
        continue;
      }
      let computed = compute_status(&server, now, self.settings.offline_timeout);
      if computed == server.status {
        continue;
      }
      let change = StatusChange {
        server_id: server.id,
        old_status: server.status,
        new_status: computed,
        timestamp: now,
      };
      // status and history land together; a failed write is re-detected next tick
      store
        .record_status_change(StatusHistoryEntry {
          observer_id: self.server_id,
          change: change.clone(),
        })
        .await?;

      if computed == ServerStatus::Offline {
        warn!(server_id = server.id, "Server '{}' went {} -> {}", server.name, server.status, computed);
      } else {
        info!(server_id = server.id, "Server '{}' went {} -> {}", server.name, server.status, computed);
      }
      // nobody listening is fine
      let _ = self.events.send(change.clone());
      transitions.push(change);
    }

    let farm_enabled = store.get_flag(FLAG_FARM_ENABLED).await?.unwrap_or(true);
    if !farm_enabled {
      info!(server_id = self.server_id, "Farm synchronization disabled, stopping health monitor");
      self.set_state(MonitorState::Stopped);
      return Ok(TickOutcome::Stop);
    }

    Ok(TickOutcome::Continue(transitions))
  }

  /// Ticks until farm sync is disabled or `shutdown` flips. Overrunning ticks
  /// are abandoned and missed ticks are skipped, never queued.
  pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
    let budget = self.settings.tick_timeout;
    let mut ticker = interval(self.settings.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
      server_id = self.server_id,
      "Health monitor started with interval {:?}", self.settings.heartbeat_interval
    );

    loop {
      tokio::select! {
        _ = ticker.tick() => {}
        _ = shutdown.changed() => break,
      }
      if *shutdown.borrow() {
        break;
      }

      if self.state() == MonitorState::Initializing {
        match timeout(budget, self.initialize(Utc::now())).await {
          Ok(Ok(())) => {}
          Ok(Err(e)) => {
            warn!(server_id = self.server_id, "Monitor initialization failed, retrying next tick: {}", e);
            continue;
          }
          Err(_) => {
            warn!(server_id = self.server_id, "Monitor initialization exceeded {:?}, abandoned", budget);
            continue;
          }
        }
      }

      match timeout(budget, self.tick(Utc::now())).await {
        Ok(Ok(TickOutcome::Stop)) => break,
        Ok(Ok(TickOutcome::Continue(_))) => {}
        Ok(Err(e)) if e.is_transient() => {
          warn!(server_id = self.server_id, "Monitor tick failed, retrying next tick: {}", e)
        }
        Ok(Err(e)) => error!(server_id = self.server_id, "Monitor tick failed: {}", e),
        Err(_) => warn!(server_id = self.server_id, "Monitor tick exceeded {:?}, abandoned", budget),
      }
    }
    info!(server_id = self.server_id, "Health monitor exited in state {:?}", self.state());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{FarmStore, MemoryStore};
  use chrono::Duration;

  struct Farm {
    store: Arc<MemoryStore>,
    registry: ServerRegistry,
  }

  fn farm() -> Farm {
    let store = Arc::new(MemoryStore::new());
    let registry = ServerRegistry::new(store.clone());
    Farm { store, registry }
  }

  fn settings() -> SyncSettings {
    SyncSettings {
      offline_timeout: Duration::seconds(60),
      ..SyncSettings::default()
    }
  }

  fn monitor(farm: &Farm, server_id: ServerId) -> HealthMonitor {
    HealthMonitor::new(server_id, false, false, farm.registry.clone(), settings())
  }

  #[tokio::test]
  async fn initialize_clears_own_history_and_runs() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let b = farm.registry.register_or_get_server("web-b").await.unwrap();
    let stale = |observer_id| StatusHistoryEntry {
      observer_id,
      change: StatusChange {
        server_id: b.id,
        old_status: ServerStatus::Online,
        new_status: ServerStatus::Offline,
        timestamp: Utc::now(),
      },
    };
    farm.store.record_status_change(stale(a.id)).await.unwrap();
    farm.store.record_status_change(stale(b.id)).await.unwrap();

    let monitor = monitor(&farm, a.id);
    assert_eq!(monitor.state(), MonitorState::Initializing);
    monitor.initialize(Utc::now()).await.unwrap();
    assert_eq!(monitor.state(), MonitorState::Running);

    let history = farm.store.list_status_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].observer_id, b.id);
    let me = farm.registry.get_server(a.id).await.unwrap();
    assert_eq!(me.status, ServerStatus::Unknown);
    assert!(me.last_ping_time.is_some());
  }

  #[tokio::test]
  async fn restarted_peer_is_reported_back_online() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let b = farm.registry.register_or_get_server("web-b").await.unwrap();
    let t0 = Utc::now();
    let watcher = monitor(&farm, a.id);
    watcher.initialize(t0).await.unwrap();
    monitor(&farm, b.id).initialize(t0).await.unwrap();

    watcher.tick(t0 + Duration::seconds(10)).await.unwrap();
    watcher.tick(t0 + Duration::seconds(120)).await.unwrap();
    assert_eq!(farm.registry.get_server(b.id).await.unwrap().status, ServerStatus::Offline);

    let restarted = monitor(&farm, b.id);
    restarted.initialize(t0 + Duration::seconds(130)).await.unwrap();
    let TickOutcome::Continue(changes) = watcher.tick(t0 + Duration::seconds(140)).await.unwrap() else {
      panic!("monitor stopped");
    };
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].server_id, b.id);
    assert_eq!(changes[0].old_status, ServerStatus::Offline);
    assert_eq!(changes[0].new_status, ServerStatus::Online);
  }

  #[tokio::test]
  async fn failed_status_write_is_retried_next_tick() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let b = farm.registry.register_or_get_server("web-b").await.unwrap();
    let t0 = Utc::now();
    farm.registry.ping(b.id, false, t0).await.unwrap();
    let monitor = monitor(&farm, a.id);
    monitor.initialize(t0).await.unwrap();
    monitor.tick(t0 + Duration::seconds(1)).await.unwrap();
    let mut events = monitor.subscribe();

    farm.store.inject_status_change_failures(1);
    assert!(monitor.tick(t0 + Duration::seconds(61)).await.is_err());
    assert!(events.try_recv().is_err());
    assert_eq!(farm.registry.get_server(b.id).await.unwrap().status, ServerStatus::Online);

    let mut offline = 0;
    for step in 0..3 {
      if let TickOutcome::Continue(changes) = monitor.tick(t0 + Duration::seconds(80 + step * 20)).await.unwrap() {
        offline += changes.iter().filter(|c| c.new_status == ServerStatus::Offline).count();
      }
    }
    assert_eq!(offline, 1);
    assert_eq!(events.try_recv().unwrap().new_status, ServerStatus::Offline);
    let history = farm.store.list_status_history(10).await.unwrap();
    assert_eq!(history[0].change.new_status, ServerStatus::Offline);
  }

  #[tokio::test]
  async fn offline_transition_fires_once() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let b = farm.registry.register_or_get_server("web-b").await.unwrap();
    let t0 = Utc::now();
    farm.registry.ping(b.id, false, t0).await.unwrap();

    let monitor = monitor(&farm, a.id);
    let mut events = monitor.subscribe();
    monitor.initialize(t0).await.unwrap();

    let TickOutcome::Continue(first) = monitor.tick(t0 + Duration::seconds(1)).await.unwrap() else {
      panic!("monitor stopped");
    };
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].new_status, ServerStatus::Online);

    let mut offline_events = 0;
    for step in 1..=10 {
      let now = t0 + Duration::seconds(60 + step * 20);
      if let TickOutcome::Continue(changes) = monitor.tick(now).await.unwrap() {
        offline_events += changes.iter().filter(|c| c.new_status == ServerStatus::Offline).count();
      }
    }
    assert_eq!(offline_events, 1);

    let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(received.len(), 2);
    assert_eq!(received[1].old_status, ServerStatus::Online);
    assert_eq!(received[1].new_status, ServerStatus::Offline);
    assert_eq!(farm.registry.get_server(b.id).await.unwrap().status, ServerStatus::Offline);
  }

  #[tokio::test]
  async fn recovery_fires_an_online_transition() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let b = farm.registry.register_or_get_server("web-b").await.unwrap();
    let t0 = Utc::now();
    farm.registry.ping(b.id, false, t0).await.unwrap();
    let monitor = monitor(&farm, a.id);
    monitor.initialize(t0).await.unwrap();
    monitor.tick(t0).await.unwrap();
    monitor.tick(t0 + Duration::seconds(120)).await.unwrap();

    farm.registry.ping(b.id, false, t0 + Duration::seconds(130)).await.unwrap();
    let outcome = monitor.tick(t0 + Duration::seconds(140)).await.unwrap();
    let TickOutcome::Continue(changes) = outcome else {
      panic!("monitor stopped");
    };
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].old_status, ServerStatus::Offline);
    assert_eq!(changes[0].new_status, ServerStatus::Online);
  }

  #[tokio::test]
  async fn disabled_servers_are_not_tracked() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let b = farm.registry.register_or_get_server("web-b").await.unwrap();
    farm.registry.ping(b.id, false, Utc::now()).await.unwrap();
    farm.registry.set_enabled(b.id, false).await.unwrap();
    let monitor = monitor(&farm, a.id);
    monitor.initialize(Utc::now()).await.unwrap();
    assert_eq!(monitor.tick(Utc::now()).await.unwrap(), TickOutcome::Continue(vec![]));
  }

  #[tokio::test]
  async fn store_outage_is_survived() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let b = farm.registry.register_or_get_server("web-b").await.unwrap();
    let t0 = Utc::now();
    farm.registry.ping(b.id, false, t0).await.unwrap();
    let monitor = monitor(&farm, a.id);
    monitor.initialize(t0).await.unwrap();

    farm.store.inject_outage(1);
    assert!(monitor.tick(t0).await.is_err());
    assert_eq!(monitor.state(), MonitorState::Running);

    let outcome = monitor.tick(t0 + Duration::seconds(1)).await.unwrap();
    assert_eq!(
      outcome,
      TickOutcome::Continue(vec![StatusChange {
        server_id: b.id,
        old_status: ServerStatus::Unknown,
        new_status: ServerStatus::Online,
        timestamp: t0 + Duration::seconds(1),
      }])
    );
  }

  #[tokio::test]
  async fn disabling_the_farm_stops_for_good() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let monitor = monitor(&farm, a.id);
    monitor.initialize(Utc::now()).await.unwrap();
    farm.store.set_flag(FLAG_FARM_ENABLED, false).await.unwrap();
    assert_eq!(monitor.tick(Utc::now()).await.unwrap(), TickOutcome::Stop);
    assert_eq!(monitor.state(), MonitorState::Stopped);

    farm.store.set_flag(FLAG_FARM_ENABLED, true).await.unwrap();
    assert_eq!(monitor.tick(Utc::now()).await.unwrap(), TickOutcome::Stop);
  }

  #[tokio::test]
  async fn non_external_nodes_publish_the_external_flag() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let monitor = HealthMonitor::new(a.id, false, true, farm.registry.clone(), settings());
    monitor.initialize(Utc::now()).await.unwrap();
    monitor.tick(Utc::now()).await.unwrap();
    assert_eq!(farm.store.get_flag(FLAG_EXTERNAL_APP_CONFIGURED).await.unwrap(), Some(true));

    let api = farm.registry.register_or_get_server("api-1").await.unwrap();
    let external = HealthMonitor::new(api.id, true, false, farm.registry.clone(), settings());
    external.initialize(Utc::now()).await.unwrap();
    external.tick(Utc::now()).await.unwrap();
    assert_eq!(farm.store.get_flag(FLAG_EXTERNAL_APP_CONFIGURED).await.unwrap(), Some(true));
    assert!(farm.registry.get_server(api.id).await.unwrap().is_external_application);
  }

  #[tokio::test(start_paused = true)]
  async fn run_exits_on_shutdown() {
    let farm = farm();
    let a = farm.registry.register_or_get_server("web-a").await.unwrap();
    let monitor = Arc::new(monitor(&farm, a.id));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(monitor.clone().run(rx));
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert_eq!(monitor.state(), MonitorState::Running);
    tx.send(true).unwrap();
    handle.await.unwrap();
  }
}
