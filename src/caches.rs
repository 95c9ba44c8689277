//! Cache-owning modules of the node binary.
//!
//! Each cache registers the task types that invalidate it. The handlers only
//! ever drop or overwrite state, so replaying them is harmless.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::error::FarmResult;
use crate::task_types::{TaskArgs, TaskTypeRegistry};

pub const OBJECT_METADATA_INVALIDATE: &str = "ObjectMetadata.Invalidate";
pub const OBJECT_METADATA_CLEAR: &str = "ObjectMetadata.Clear";
pub const SETTINGS_INVALIDATE: &str = "Settings.Invalidate";
pub const FILES_WRITE: &str = "Files.Write";

pub struct KeyedCache<V> {
  name: &'static str,
  entries: RwLock<HashMap<String, V>>,
}

impl<V: Clone> KeyedCache<V> {
  pub fn new(name: &'static str) -> Self {
    Self {
      name,
      entries: RwLock::new(HashMap::new()),
    }
  }

  pub fn get(&self, key: &str) -> Option<V> {
    self.entries.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
  }

  pub fn insert(&self, key: impl Into<String>, value: V) {
    self
      .entries
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.into(), value);
  }

  pub fn invalidate<S: AsRef<str>>(&self, keys: &[S]) -> usize {
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    let removed = keys.iter().filter(|k| entries.remove(k.as_ref()).is_some()).count();
    debug!(cache = self.name, removed, "Cache keys invalidated");
    removed
  }

  pub fn clear(&self) {
    self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    debug!(cache = self.name, "Cache cleared");
  }

  pub fn len(&self) -> usize {
    self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self
      .entries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .keys()
      .cloned()
      .collect();
    keys.sort();
    keys
  }
}

/// Node-local files kept in sync across the farm. Held in process like the
/// caches, but its task type is durable: a restarted node rebuilds it by
/// replaying the `Files.Write` entries still in the log past its checkpoint.
#[derive(Default)]
pub struct FileStore {
  files: RwLock<HashMap<String, Vec<u8>>>,
}

impl FileStore {
  pub fn write(&self, path: &str, contents: &[u8]) {
    self
      .files
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(path.to_string(), contents.to_vec());
  }

  pub fn read(&self, path: &str) -> Option<Vec<u8>> {
    self.files.read().unwrap_or_else(PoisonError::into_inner).get(path).cloned()
  }
}

pub struct AppCaches {
  pub object_metadata: Arc<KeyedCache<serde_json::Value>>,
  pub settings: Arc<KeyedCache<String>>,
  pub files: Arc<FileStore>,
}

impl AppCaches {
  pub fn new() -> Self {
    Self {
      object_metadata: Arc::new(KeyedCache::new("object_metadata")),
      settings: Arc::new(KeyedCache::new("settings")),
      files: Arc::new(FileStore::default()),
    }
  }

  pub fn register_task_types(&self, registry: &mut TaskTypeRegistry) -> FarmResult<()> {
    let metadata = self.object_metadata.clone();
    registry.register(OBJECT_METADATA_INVALIDATE, true, move |args| {
      metadata.invalidate(args.text_parameters);
      Ok(())
    })?;

    let metadata = self.object_metadata.clone();
    registry.register(OBJECT_METADATA_CLEAR, true, move |_| {
      metadata.clear();
      Ok(())
    })?;

    let settings = self.settings.clone();
    registry.register(SETTINGS_INVALIDATE, true, move |args| {
      settings.invalidate(args.text_parameters);
      Ok(())
    })?;

    let files = self.files.clone();
    registry.register(FILES_WRITE, false, move |args| write_file(&files, args))?;
    Ok(())
  }
}

impl Default for AppCaches {
  fn default() -> Self {
    Self::new()
  }
}

fn write_file(files: &FileStore, args: TaskArgs<'_>) -> anyhow::Result<()> {
  let path = args
    .text_parameters
    .first()
    .context("Files.Write needs the file path as first parameter")?;
  let contents = args
    .binary_payload
    .ok_or_else(|| anyhow!("Files.Write for '{}' carries no payload", path))?;
  files.write(path, contents);
  Ok(())
}
