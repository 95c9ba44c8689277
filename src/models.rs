use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub type ServerId = i64;
pub type SequenceId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
  Unknown,
  Online,
  Offline,
}

impl ServerStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ServerStatus::Unknown => "unknown",
      ServerStatus::Online => "online",
      ServerStatus::Offline => "offline",
    }
  }

  /// Derives liveness from the age of the last heartbeat. A node that never
  /// pinged is `Unknown`; a ping exactly `timeout` old still counts as online.
  pub fn from_ping(last_ping: Option<DateTime<Utc>>, now: DateTime<Utc>, timeout: Duration) -> Self {
    match last_ping {
      None => ServerStatus::Unknown,
      Some(ping) if now - ping > timeout => ServerStatus::Offline,
      Some(_) => ServerStatus::Online,
    }
  }
}

impl fmt::Display for ServerStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ServerStatus {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "unknown" => Ok(ServerStatus::Unknown),
      "online" => Ok(ServerStatus::Online),
      "offline" => Ok(ServerStatus::Offline),
      other => Err(StoreError::Corrupt(format!("unknown server status '{}'", other))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerNode {
  pub id: ServerId,
  pub name: String,
  pub enabled: bool,
  pub is_external_application: bool,
  /// Last status persisted by a health monitor, not necessarily current.
  pub status: ServerStatus,
  pub last_ping_time: Option<DateTime<Utc>>,
  pub last_status_change_time: Option<DateTime<Utc>>,
  /// Highest sequence id this server reported as processed.
  pub last_processed_sequence: Option<SequenceId>,
}

impl ServerNode {
  pub fn new(id: ServerId, name: impl Into<String>) -> Self {
    Self {
      id,
      name: name.into(),
      enabled: true,
      is_external_application: false,
      status: ServerStatus::Unknown,
      last_ping_time: None,
      last_status_change_time: None,
      last_processed_sequence: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "server_id")]
pub enum TaskTarget {
  #[default]
  AllServers,
  Server(ServerId),
}

impl TaskTarget {
  pub fn includes(&self, server_id: ServerId) -> bool {
    match self {
      TaskTarget::AllServers => true,
      TaskTarget::Server(id) => *id == server_id,
    }
  }

  pub fn server_id(&self) -> Option<ServerId> {
    match self {
      TaskTarget::AllServers => None,
      TaskTarget::Server(id) => Some(*id),
    }
  }

  pub fn from_server_id(server_id: Option<ServerId>) -> Self {
    server_id.map_or(TaskTarget::AllServers, TaskTarget::Server)
  }
}

impl fmt::Display for TaskTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskTarget::AllServers => f.write_str("*"),
      TaskTarget::Server(id) => write!(f, "server:{}", id),
    }
  }
}

/// A broadcast task before the log has assigned it a sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskEntry {
  pub origin_server_id: ServerId,
  pub type_name: String,
  pub target: TaskTarget,
  pub text_parameters: Vec<String>,
  pub binary_payload: Option<Vec<u8>>,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
  pub sequence_id: SequenceId,
  pub origin_server_id: ServerId,
  pub type_name: String,
  pub target: TaskTarget,
  pub text_parameters: Vec<String>,
  pub binary_payload: Option<Vec<u8>>,
  pub created_at: DateTime<Utc>,
}

impl TaskLogEntry {
  pub fn from_new(sequence_id: SequenceId, entry: NewTaskEntry) -> Self {
    Self {
      sequence_id,
      origin_server_id: entry.origin_server_id,
      type_name: entry.type_name,
      target: entry.target,
      text_parameters: entry.text_parameters,
      binary_payload: entry.binary_payload,
      created_at: entry.created_at,
    }
  }
}

/// Raised by a health monitor when a node's computed status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
  pub server_id: ServerId,
  pub old_status: ServerStatus,
  pub new_status: ServerStatus,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
  /// Node whose monitor observed the transition.
  pub observer_id: ServerId,
  pub change: StatusChange,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_follows_ping_age() {
    let now = Utc::now();
    let timeout = Duration::seconds(60);
    assert_eq!(ServerStatus::from_ping(None, now, timeout), ServerStatus::Unknown);
    assert_eq!(
      ServerStatus::from_ping(Some(now - Duration::seconds(59)), now, timeout),
      ServerStatus::Online
    );
    assert_eq!(
      ServerStatus::from_ping(Some(now - Duration::seconds(60)), now, timeout),
      ServerStatus::Online
    );
    assert_eq!(
      ServerStatus::from_ping(Some(now - Duration::seconds(61)), now, timeout),
      ServerStatus::Offline
    );
  }

  #[test]
  fn status_parses_its_own_names() {
    for status in [ServerStatus::Unknown, ServerStatus::Online, ServerStatus::Offline] {
      assert_eq!(status.as_str().parse::<ServerStatus>().unwrap(), status);
    }
    assert!("degraded".parse::<ServerStatus>().is_err());
  }

  #[test]
  fn target_inclusion() {
    assert!(TaskTarget::AllServers.includes(7));
    assert!(TaskTarget::Server(7).includes(7));
    assert!(!TaskTarget::Server(7).includes(8));
    assert_eq!(TaskTarget::from_server_id(None), TaskTarget::AllServers);
    assert_eq!(TaskTarget::from_server_id(Some(3)), TaskTarget::Server(3));
  }
}
