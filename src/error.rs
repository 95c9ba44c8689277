//! Error types for the synchronization engine.
//!
//! Storage problems are `StoreError`; everything a caller of the engine can get
//! wrong (bad registrations, bad broadcast targets) is `FarmError`. Task handlers
//! and binaries stay on `anyhow`.

use thiserror::Error;

use crate::models::ServerId;

#[derive(Error, Debug)]
pub enum StoreError {
  /// The shared store could not be reached. Callers retry on their next tick.
  #[error("store unavailable: {0}")]
  Unavailable(String),

  #[error("{entity} not found: {id}")]
  NotFound { entity: &'static str, id: String },

  /// A row could not be mapped back onto the domain model.
  #[error("corrupt record: {0}")]
  Corrupt(String),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration failed: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
  pub fn is_transient(&self) -> bool {
    matches!(self, StoreError::Unavailable(_) | StoreError::Database(_))
  }
}

#[derive(Error, Debug)]
pub enum FarmError {
  /// Two modules claimed the same task type name. Fatal at startup.
  #[error("task type '{0}' is already registered")]
  DuplicateTaskType(String),

  #[error("invalid task type name '{0}'")]
  InvalidTaskTypeName(String),

  /// A node tried to broadcast a type it cannot execute itself.
  #[error("task type '{0}' is not registered on this node")]
  UnregisteredTaskType(String),

  #[error("invalid broadcast target: {0}")]
  InvalidTarget(String),

  #[error("unknown server {0}")]
  UnknownServer(ServerId),

  #[error(transparent)]
  Store(#[from] StoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type FarmResult<T> = Result<T, FarmError>;
