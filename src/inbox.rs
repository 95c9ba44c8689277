use tokio::sync::broadcast;
use tracing::debug;

use crate::models::TaskLogEntry;

const INBOX_CAPACITY: usize = 1024;

/// Direct in-process push of freshly appended memory tasks.
///
/// Consumers sharing an inbox with the dispatcher wake up and poll the log as
/// soon as something lands, instead of waiting for their next tick. The log
/// is still the source of truth; a lagging or missing receiver only delays
/// convergence until the regular poll.
#[derive(Clone)]
pub struct TaskInbox {
  sender: broadcast::Sender<TaskLogEntry>,
}

impl TaskInbox {
  pub fn new() -> Self {
    let (sender, _) = broadcast::channel(INBOX_CAPACITY);
    Self { sender }
  }

  pub fn push(&self, entry: &TaskLogEntry) {
    // no receivers just means nobody is live in this process
    if let Ok(receivers) = self.sender.send(entry.clone()) {
      debug!(sequence_id = entry.sequence_id, receivers, "Pushed task to live inboxes");
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<TaskLogEntry> {
    self.sender.subscribe()
  }
}

impl Default for TaskInbox {
  fn default() -> Self {
    Self::new()
  }
}
