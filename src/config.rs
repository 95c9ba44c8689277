use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

/// What a restarted node does with memory-only tasks created while it was down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryReplayPolicy {
  /// Skip them: the in-memory state they invalidate died with the old process.
  SkipWhileOffline,
  ReplayAll,
}

impl FromStr for MemoryReplayPolicy {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "skip-offline" => Ok(MemoryReplayPolicy::SkipWhileOffline),
      "replay-all" => Ok(MemoryReplayPolicy::ReplayAll),
      other => Err(anyhow!("unknown memory replay policy '{}'", other)),
    }
  }
}

/// Knobs of the synchronization engine.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub heartbeat_interval: Duration,
  pub consumer_interval: Duration,
  /// Age of the last ping after which a node counts as offline.
  pub offline_timeout: chrono::Duration,
  /// Budget for one health monitor tick.
  pub tick_timeout: Duration,
  pub batch_size: usize,
  /// Consumer ticks between two task-log GC passes, 0 disables GC.
  pub gc_every_ticks: u64,
  pub memory_replay: MemoryReplayPolicy,
  pub resume_from_checkpoint: bool,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      heartbeat_interval: Duration::from_secs(20),
      consumer_interval: Duration::from_millis(1000),
      offline_timeout: chrono::Duration::seconds(60),
      tick_timeout: Duration::from_secs(10),
      batch_size: 500,
      gc_every_ticks: 60,
      memory_replay: MemoryReplayPolicy::SkipWhileOffline,
      resume_from_checkpoint: true,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub server_port: u16,
  pub server_name: String,
  pub is_external_application: bool,
  pub external_app_configured: bool,
  pub sync: SyncSettings,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let defaults = SyncSettings::default();
    let server_name = env::var("FARMSYNC_SERVER_NAME")
      .or_else(|_| env::var("HOSTNAME"))
      .unwrap_or_else(|_| "node".into());

    Ok(Self {
      database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
      server_port: env_or("SERVER_PORT", 8080)?,
      server_name,
      is_external_application: env_or("FARMSYNC_EXTERNAL_APPLICATION", false)?,
      external_app_configured: env_or("FARMSYNC_EXTERNAL_APP_CONFIGURED", false)?,
      sync: SyncSettings {
        heartbeat_interval: Duration::from_secs(env_or("FARMSYNC_HEARTBEAT_SECS", 20)?),
        consumer_interval: Duration::from_millis(env_or("FARMSYNC_CONSUMER_MILLIS", 1000)?),
        offline_timeout: chrono::Duration::seconds(env_or("FARMSYNC_OFFLINE_TIMEOUT_SECS", 60)?),
        tick_timeout: Duration::from_secs(env_or("FARMSYNC_TICK_TIMEOUT_SECS", 10)?),
        batch_size: non_zero("FARMSYNC_BATCH_SIZE", env_or("FARMSYNC_BATCH_SIZE", defaults.batch_size)?)?,
        gc_every_ticks: env_or("FARMSYNC_GC_EVERY_TICKS", defaults.gc_every_ticks)?,
        memory_replay: env_or("FARMSYNC_MEMORY_REPLAY", defaults.memory_replay)?,
        resume_from_checkpoint: env_or("FARMSYNC_RESUME_CHECKPOINT", defaults.resume_from_checkpoint)?,
      },
    })
  }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: Display,
{
  match env::var(name) {
    Ok(raw) => parse_value(name, &raw),
    Err(_) => Ok(default),
  }
}

fn non_zero(name: &str, value: usize) -> Result<usize> {
  ensure!(value > 0, "{} must be at least 1", name);
  Ok(value)
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T>
where
  T: FromStr,
  T::Err: Display,
{
  raw
    .trim()
    .parse()
    .map_err(|e| anyhow!("invalid value '{}' for {}: {}", raw, name, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_the_documented_knobs() {
    let settings = SyncSettings::default();
    assert_eq!(settings.heartbeat_interval, Duration::from_secs(20));
    assert_eq!(settings.offline_timeout, chrono::Duration::seconds(60));
    assert_eq!(settings.memory_replay, MemoryReplayPolicy::SkipWhileOffline);
    assert!(settings.resume_from_checkpoint);
  }

  #[test]
  fn replay_policy_parses() {
    assert_eq!("replay-all".parse::<MemoryReplayPolicy>().unwrap(), MemoryReplayPolicy::ReplayAll);
    assert_eq!(
      "skip-offline".parse::<MemoryReplayPolicy>().unwrap(),
      MemoryReplayPolicy::SkipWhileOffline
    );
    assert!("sometimes".parse::<MemoryReplayPolicy>().is_err());
  }

  #[test]
  fn bad_values_name_the_variable() {
    let err = parse_value::<u64>("FARMSYNC_HEARTBEAT_SECS", "soon").unwrap_err();
    assert!(err.to_string().contains("FARMSYNC_HEARTBEAT_SECS"));
    assert!(parse_value::<bool>("X", " true ").unwrap());
  }

  #[test]
  fn zero_batch_size_is_rejected() {
    let err = non_zero("FARMSYNC_BATCH_SIZE", 0).unwrap_err();
    assert!(err.to_string().contains("FARMSYNC_BATCH_SIZE"));
    assert_eq!(non_zero("FARMSYNC_BATCH_SIZE", 1).unwrap(), 1);
  }
}
