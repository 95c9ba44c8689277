use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::error::{FarmError, FarmResult, StoreResult};
use crate::models::{ServerId, ServerNode, ServerStatus};
use crate::store::FarmStore;

/// Durable table of farm members and their liveness.
#[derive(Clone)]
pub struct ServerRegistry {
  store: Arc<dyn FarmStore>,
}

impl ServerRegistry {
  pub fn new(store: Arc<dyn FarmStore>) -> Self {
    Self { store }
  }

  pub fn store(&self) -> &Arc<dyn FarmStore> {
    &self.store
  }

  /// Returns the row for `name`, creating it when the node joins for the
  /// first time. The row is returned as it was before this process touched
  /// it, which is what a restarting node needs to know about its last run.
  pub async fn register_or_get_server(&self, name: &str) -> StoreResult<ServerNode> {
    let server = self.store.upsert_server(name).await?;
    info!(server_id = server.id, "Registered server '{}'", name);
    Ok(server)
  }

  pub async fn ping(&self, server_id: ServerId, is_external_application: bool, now: DateTime<Utc>) -> StoreResult<()> {
    self.store.update_ping(server_id, is_external_application, now).await?;
    debug!(server_id, "Heartbeat written");
    Ok(())
  }

  pub async fn get_server(&self, server_id: ServerId) -> FarmResult<ServerNode> {
    self
      .store
      .get_server(server_id)
      .await?
      .ok_or(FarmError::UnknownServer(server_id))
  }

  /// Reads the current ping time and derives the status from it. Never writes.
  pub async fn compute_status(&self, server_id: ServerId, now: DateTime<Utc>, timeout: Duration) -> FarmResult<ServerStatus> {
    let server = self.get_server(server_id).await?;
    Ok(compute_status(&server, now, timeout))
  }

  pub async fn list_servers(&self, include_disabled: bool) -> StoreResult<Vec<ServerNode>> {
    self.store.list_servers(include_disabled).await
  }

  pub async fn set_enabled(&self, server_id: ServerId, enabled: bool) -> StoreResult<()> {
    self.store.set_server_enabled(server_id, enabled).await?;
    info!(server_id, enabled, "Server enabled flag changed");
    Ok(())
  }
}

pub fn compute_status(server: &ServerNode, now: DateTime<Utc>, timeout: Duration) -> ServerStatus {
  ServerStatus::from_ping(server.last_ping_time, now, timeout)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;

  fn registry() -> ServerRegistry {
    ServerRegistry::new(Arc::new(MemoryStore::new()))
  }

  #[tokio::test]
  async fn registration_reuses_existing_ids() {
    let registry = registry();
    let first = registry.register_or_get_server("web-1").await.unwrap();
    let second = registry.register_or_get_server("web-1").await.unwrap();
    assert_eq!(first.id, second.id);
    assert!(first.enabled);
    assert_eq!(first.status, ServerStatus::Unknown);
  }

  #[tokio::test]
  async fn status_is_derived_from_last_ping() {
    let registry = registry();
    let server = registry.register_or_get_server("web-1").await.unwrap();
    let timeout = Duration::seconds(60);
    let t0 = Utc::now();

    assert_eq!(
      registry.compute_status(server.id, t0, timeout).await.unwrap(),
      ServerStatus::Unknown
    );

    registry.ping(server.id, false, t0).await.unwrap();
    assert_eq!(
      registry.compute_status(server.id, t0 + Duration::seconds(30), timeout).await.unwrap(),
      ServerStatus::Online
    );
    assert_eq!(
      registry.compute_status(server.id, t0 + Duration::seconds(90), timeout).await.unwrap(),
      ServerStatus::Offline
    );

    // computing never persists anything
    let row = registry.get_server(server.id).await.unwrap();
    assert_eq!(row.status, ServerStatus::Unknown);
  }

  #[tokio::test]
  async fn ping_records_the_external_role() {
    let registry = registry();
    let server = registry.register_or_get_server("api-1").await.unwrap();
    registry.ping(server.id, true, Utc::now()).await.unwrap();
    assert!(registry.get_server(server.id).await.unwrap().is_external_application);
  }

  #[tokio::test]
  async fn concurrent_pings_from_one_node() {
    let registry = registry();
    let server = registry.register_or_get_server("web-1").await.unwrap();
    let now = Utc::now();
    let pings = (0..8).map(|i| {
      let registry = registry.clone();
      tokio::spawn(async move { registry.ping(server.id, false, now + Duration::milliseconds(i)).await })
    });
    for handle in futures::future::join_all(pings).await {
      handle.unwrap().unwrap();
    }
    assert!(registry.get_server(server.id).await.unwrap().last_ping_time.is_some());
  }

  #[tokio::test]
  async fn unknown_server_is_reported() {
    let registry = registry();
    let err = registry.compute_status(42, Utc::now(), Duration::seconds(1)).await.unwrap_err();
    assert!(matches!(err, FarmError::UnknownServer(42)));
  }
}
