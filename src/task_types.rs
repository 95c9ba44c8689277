//! Process-local table of task types this node knows how to execute.
//!
//! Every module that owns invalidatable state registers its task types once at
//! startup. The table is then frozen behind an `Arc` and only read by the
//! dispatcher and the consumer. Type names are the farm-wide protocol, so a
//! duplicate name is a startup error rather than a silent overwrite.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::{FarmError, FarmResult};
use crate::models::TaskTarget;

static TYPE_NAME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*$").expect("type name pattern is valid"));

/// Arguments a handler receives for one log entry.
#[derive(Debug, Clone, Copy)]
pub struct TaskArgs<'a> {
  pub target: TaskTarget,
  pub text_parameters: &'a [String],
  pub binary_payload: Option<&'a [u8]>,
}

/// Must be idempotent: the same arguments may be delivered more than once.
pub type TaskHandler = Arc<dyn Fn(TaskArgs<'_>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct TaskTypeRegistration {
  pub type_name: String,
  pub handler: TaskHandler,
  /// Only matters to live in-memory state; not replayed to a node that was
  /// offline when the task was created.
  pub is_memory_task: bool,
}

impl fmt::Debug for TaskTypeRegistration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskTypeRegistration")
      .field("type_name", &self.type_name)
      .field("is_memory_task", &self.is_memory_task)
      .finish_non_exhaustive()
  }
}

#[derive(Default, Debug)]
pub struct TaskTypeRegistry {
  types: HashMap<String, TaskTypeRegistration>,
}

impl TaskTypeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<F>(&mut self, type_name: &str, is_memory_task: bool, handler: F) -> FarmResult<()>
  where
    F: Fn(TaskArgs<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
  {
    if !TYPE_NAME.is_match(type_name) {
      return Err(FarmError::InvalidTaskTypeName(type_name.to_string()));
    }
    if self.types.contains_key(type_name) {
      return Err(FarmError::DuplicateTaskType(type_name.to_string()));
    }
    self.types.insert(
      type_name.to_string(),
      TaskTypeRegistration {
        type_name: type_name.to_string(),
        handler: Arc::new(handler),
        is_memory_task,
      },
    );
    Ok(())
  }

  pub fn lookup(&self, type_name: &str) -> Option<&TaskTypeRegistration> {
    self.types.get(type_name)
  }

  pub fn type_names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }

  /// Runs the local handler for `type_name` directly, the way a caller applies
  /// a mutation to itself before broadcasting it.
  pub fn apply_locally(&self, type_name: &str, args: TaskArgs<'_>) -> FarmResult<anyhow::Result<()>> {
    let registration = self
      .lookup(type_name)
      .ok_or_else(|| FarmError::UnregisteredTaskType(type_name.to_string()))?;
    Ok((registration.handler)(args))
  }
}
