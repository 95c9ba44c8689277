//! Shared storage used by every node of the farm.
//!
//! The server registry and the task log are the only state shared between
//! nodes. Everything goes through single-row upserts or appends; no
//! operation here takes a lock that spans nodes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::models::{NewTaskEntry, SequenceId, ServerId, ServerNode, StatusHistoryEntry, TaskLogEntry};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Farm-wide switch for synchronization as a whole.
pub const FLAG_FARM_ENABLED: &str = "farm_enabled";
/// Whether the farm expects an external-application node to be pinging.
pub const FLAG_EXTERNAL_APP_CONFIGURED: &str = "external_application_configured";

#[async_trait]
pub trait FarmStore: Send + Sync {
  /// Returns the existing row for `name`, or creates an enabled one.
  async fn upsert_server(&self, name: &str) -> StoreResult<ServerNode>;

  async fn get_server(&self, id: ServerId) -> StoreResult<Option<ServerNode>>;

  async fn list_servers(&self, include_disabled: bool) -> StoreResult<Vec<ServerNode>>;

  async fn update_ping(&self, id: ServerId, is_external_application: bool, at: DateTime<Utc>) -> StoreResult<()>;

  async fn set_server_enabled(&self, id: ServerId, enabled: bool) -> StoreResult<()>;

  async fn record_checkpoint(&self, id: ServerId, sequence_id: SequenceId) -> StoreResult<()>;

  /// Persists the observed server's new status and appends the history row
  /// in one write. On error neither is stored.
  async fn record_status_change(&self, entry: StatusHistoryEntry) -> StoreResult<()>;

  /// Drops every history row observed by `observer_id`.
  async fn clear_status_history(&self, observer_id: ServerId) -> StoreResult<u64>;

  /// Most recent first.
  async fn list_status_history(&self, limit: usize) -> StoreResult<Vec<StatusHistoryEntry>>;

  /// Appends one entry and returns its sequence id. Ids are strictly
  /// increasing across all nodes, and an id is never visible to readers
  /// before every smaller id is.
  async fn append_task(&self, entry: NewTaskEntry) -> StoreResult<SequenceId>;

  /// Entries with `sequence_id > after`, ascending, at most `limit` of them.
  async fn read_entries_since(&self, after: SequenceId, limit: usize) -> StoreResult<Vec<TaskLogEntry>>;

  /// High-water mark of the log, 0 when nothing was ever appended.
  async fn max_sequence(&self) -> StoreResult<SequenceId>;

  async fn delete_entries_through(&self, sequence_id: SequenceId) -> StoreResult<u64>;

  async fn get_flag(&self, name: &str) -> StoreResult<Option<bool>>;

  async fn set_flag(&self, name: &str, value: bool) -> StoreResult<()>;
}
