use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use super::FarmStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{
  NewTaskEntry, SequenceId, ServerId, ServerNode, StatusChange, StatusHistoryEntry, TaskLogEntry, TaskTarget,
};

/// Key of the transaction-scoped advisory lock that serializes appends, so
/// that commit order matches `sequence_id` order.
const TASK_APPEND_LOCK: i64 = 0x6661_726d_7379_6e63;

const SERVER_COLUMNS: &str = "id, name, enabled, is_external_application, status, last_ping_time, \
  last_status_change_time, last_processed_sequence";

#[derive(FromRow)]
struct ServerRow {
  id: i64,
  name: String,
  enabled: bool,
  is_external_application: bool,
  status: String,
  last_ping_time: Option<DateTime<Utc>>,
  last_status_change_time: Option<DateTime<Utc>>,
  last_processed_sequence: Option<i64>,
}

impl TryFrom<ServerRow> for ServerNode {
  type Error = StoreError;

  fn try_from(row: ServerRow) -> Result<Self, Self::Error> {
    Ok(ServerNode {
      id: row.id,
      name: row.name,
      enabled: row.enabled,
      is_external_application: row.is_external_application,
      status: row.status.parse()?,
      last_ping_time: row.last_ping_time,
      last_status_change_time: row.last_status_change_time,
      last_processed_sequence: row.last_processed_sequence,
    })
  }
}

#[derive(FromRow)]
struct TaskRow {
  sequence_id: i64,
  origin_server_id: i64,
  type_name: String,
  target_server_id: Option<i64>,
  text_parameters: Vec<String>,
  binary_payload: Option<Vec<u8>>,
  created_at: DateTime<Utc>,
}

impl From<TaskRow> for TaskLogEntry {
  fn from(row: TaskRow) -> Self {
    TaskLogEntry {
      sequence_id: row.sequence_id,
      origin_server_id: row.origin_server_id,
      type_name: row.type_name,
      target: TaskTarget::from_server_id(row.target_server_id),
      text_parameters: row.text_parameters,
      binary_payload: row.binary_payload,
      created_at: row.created_at,
    }
  }
}

#[derive(FromRow)]
struct HistoryRow {
  observer_id: i64,
  server_id: i64,
  old_status: String,
  new_status: String,
  changed_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for StatusHistoryEntry {
  type Error = StoreError;

  fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
    Ok(StatusHistoryEntry {
      observer_id: row.observer_id,
      change: StatusChange {
        server_id: row.server_id,
        old_status: row.old_status.parse()?,
        new_status: row.new_status.parse()?,
        timestamp: row.changed_at,
      },
    })
  }
}

/// Postgres-backed farm store. One database shared by every node.
#[derive(Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }
}

fn expect_row(rows_affected: u64, id: ServerId) -> StoreResult<()> {
  if rows_affected == 0 {
    return Err(StoreError::NotFound {
      entity: "server",
      id: id.to_string(),
    });
  }
  Ok(())
}

#[async_trait]
impl FarmStore for PgStore {
  async fn upsert_server(&self, name: &str) -> StoreResult<ServerNode> {
    let query = format!(
      "INSERT INTO farm_servers (name) VALUES ($1)
       ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
       RETURNING {}",
      SERVER_COLUMNS
    );
    let row: ServerRow = sqlx::query_as(&query).bind(name).fetch_one(&self.pool).await?;
    row.try_into()
  }

  async fn get_server(&self, id: ServerId) -> StoreResult<Option<ServerNode>> {
    let query = format!("SELECT {} FROM farm_servers WHERE id = $1", SERVER_COLUMNS);
    let row: Option<ServerRow> = sqlx::query_as(&query).bind(id).fetch_optional(&self.pool).await?;
    row.map(ServerNode::try_from).transpose()
  }

  async fn list_servers(&self, include_disabled: bool) -> StoreResult<Vec<ServerNode>> {
    let query = format!(
      "SELECT {} FROM farm_servers WHERE enabled OR $1 ORDER BY id",
      SERVER_COLUMNS
    );
    let rows: Vec<ServerRow> = sqlx::query_as(&query)
      .bind(include_disabled)
      .fetch_all(&self.pool)
      .await?;
    rows.into_iter().map(ServerNode::try_from).collect()
  }

  async fn update_ping(&self, id: ServerId, is_external_application: bool, at: DateTime<Utc>) -> StoreResult<()> {
    let result = sqlx::query(
      "UPDATE farm_servers SET last_ping_time = $2, is_external_application = $3 WHERE id = $1",
    )
      .bind(id)
      .bind(at)
      .bind(is_external_application)
      .execute(&self.pool)
      .await?;
    expect_row(result.rows_affected(), id)
  }

  async fn set_server_enabled(&self, id: ServerId, enabled: bool) -> StoreResult<()> {
    let result = sqlx::query("UPDATE farm_servers SET enabled = $2 WHERE id = $1")
      .bind(id)
      .bind(enabled)
      .execute(&self.pool)
      .await?;
    expect_row(result.rows_affected(), id)
  }

  async fn record_checkpoint(&self, id: ServerId, sequence_id: SequenceId) -> StoreResult<()> {
    let result = sqlx::query(
      "UPDATE farm_servers
       SET last_processed_sequence = GREATEST(COALESCE(last_processed_sequence, $2), $2)
       WHERE id = $1",
    )
      .bind(id)
      .bind(sequence_id)
      .execute(&self.pool)
      .await?;
    expect_row(result.rows_affected(), id)
  }

  async fn record_status_change(&self, entry: StatusHistoryEntry) -> StoreResult<()> {
    let mut tx = self.pool.begin().await?;
    let result = sqlx::query(
      "UPDATE farm_servers SET status = $2, last_status_change_time = $3 WHERE id = $1",
    )
      .bind(entry.change.server_id)
      .bind(entry.change.new_status.as_str())
      .bind(entry.change.timestamp)
      .execute(&mut *tx)
      .await?;
    expect_row(result.rows_affected(), entry.change.server_id)?;
    sqlx::query(
      "INSERT INTO farm_status_history (observer_id, server_id, old_status, new_status, changed_at)
       VALUES ($1, $2, $3, $4, $5)",
    )
      .bind(entry.observer_id)
      .bind(entry.change.server_id)
      .bind(entry.change.old_status.as_str())
      .bind(entry.change.new_status.as_str())
      .bind(entry.change.timestamp)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;
    Ok(())
  }

  async fn clear_status_history(&self, observer_id: ServerId) -> StoreResult<u64> {
    let result = sqlx::query("DELETE FROM farm_status_history WHERE observer_id = $1")
      .bind(observer_id)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected())
  }

  async fn list_status_history(&self, limit: usize) -> StoreResult<Vec<StatusHistoryEntry>> {
    let rows: Vec<HistoryRow> = sqlx::query_as(
      "SELECT observer_id, server_id, old_status, new_status, changed_at
       FROM farm_status_history ORDER BY id DESC LIMIT $1",
    )
      .bind(limit as i64)
      .fetch_all(&self.pool)
      .await?;
    rows.into_iter().map(StatusHistoryEntry::try_from).collect()
  }

  async fn append_task(&self, entry: NewTaskEntry) -> StoreResult<SequenceId> {
    let mut tx = self.pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
      .bind(TASK_APPEND_LOCK)
      .execute(&mut *tx)
      .await?;
    let sequence_id: i64 = sqlx::query_scalar(
      "INSERT INTO farm_tasks (origin_server_id, type_name, target_server_id, text_parameters, binary_payload, created_at)
       VALUES ($1, $2, $3, $4, $5, $6)
       RETURNING sequence_id",
    )
      .bind(entry.origin_server_id)
      .bind(&entry.type_name)
      .bind(entry.target.server_id())
      .bind(&entry.text_parameters)
      .bind(&entry.binary_payload)
      .bind(entry.created_at)
      .fetch_one(&mut *tx)
      .await?;
    tx.commit().await?;
    Ok(sequence_id)
  }

  async fn read_entries_since(&self, after: SequenceId, limit: usize) -> StoreResult<Vec<TaskLogEntry>> {
    let rows: Vec<TaskRow> = sqlx::query_as(
      "SELECT sequence_id, origin_server_id, type_name, target_server_id, text_parameters, binary_payload, created_at
       FROM farm_tasks WHERE sequence_id > $1 ORDER BY sequence_id LIMIT $2",
    )
      .bind(after)
      .bind(limit as i64)
      .fetch_all(&self.pool)
      .await?;
    Ok(rows.into_iter().map(TaskLogEntry::from).collect())
  }

  async fn max_sequence(&self) -> StoreResult<SequenceId> {
    let value: i64 = sqlx::query_scalar(
      "SELECT CASE WHEN is_called THEN last_value ELSE 0 END FROM farm_tasks_sequence_id_seq",
    )
      .fetch_one(&self.pool)
      .await?;
    Ok(value)
  }

  async fn delete_entries_through(&self, sequence_id: SequenceId) -> StoreResult<u64> {
    let result = sqlx::query("DELETE FROM farm_tasks WHERE sequence_id <= $1")
      .bind(sequence_id)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected())
  }

  async fn get_flag(&self, name: &str) -> StoreResult<Option<bool>> {
    let value: Option<bool> = sqlx::query_scalar("SELECT value FROM farm_settings WHERE name = $1")
      .bind(name)
      .fetch_optional(&self.pool)
      .await?;
    Ok(value)
  }

  async fn set_flag(&self, name: &str, value: bool) -> StoreResult<()> {
    sqlx::query(
      "INSERT INTO farm_settings (name, value) VALUES ($1, $2)
       ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
    )
      .bind(name)
      .bind(value)
      .execute(&self.pool)
      .await?;
    Ok(())
  }
}
