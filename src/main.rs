use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;
use warp::Filter;

use farmsync::caches::AppCaches;
use farmsync::config::Config;
use farmsync::database::setup_database;
use farmsync::node::{FarmNode, NodeOptions};
use farmsync::routes::{handle_rejection, routes};
use farmsync::store::PgStore;
use farmsync::task_types::TaskTypeRegistry;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  let pool = setup_database(&config.database_url)
    .await
    .context("Failed to set up the farm database")?;

  // a duplicate type name is a packaging conflict: refuse to join the farm
  let caches = AppCaches::new();
  let mut task_types = TaskTypeRegistry::new();
  caches
    .register_task_types(&mut task_types)
    .context("Task type registration failed")?;

  let node = Arc::new(
    FarmNode::start(
      Arc::new(PgStore::new(pool)),
      NodeOptions::from(&config),
      task_types,
      None,
    )
    .await
    .context("Failed to join the farm")?,
  );

  let api = routes(node.clone())
    .recover(handle_rejection)
    .with(warp::trace::request());

  let shutdown_signal = async {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");
  };
  let (addr, server) = warp::serve(api).bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), shutdown_signal);
  info!("Admin API listening on {}", addr);
  server.await;

  node.shutdown().await;
  Ok(())
}
