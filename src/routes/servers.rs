use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use warp::Filter;

use super::{reject, with_node};
use crate::models::{ServerId, ServerNode, ServerStatus};
use crate::node::FarmNode;
use crate::server_registry::compute_status;
use crate::store::FLAG_FARM_ENABLED;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
  #[serde(default)]
  pub include_disabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerView {
  #[serde(flatten)]
  pub server: ServerNode,
  /// Status derived from the ping age right now, as opposed to the last
  /// status a monitor persisted.
  pub computed_status: ServerStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnabledFlag {
  pub enabled: bool,
}

pub fn servers_routes(node: Arc<FarmNode>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  let list = warp::path!("servers")
    .and(warp::get())
    .and(warp::query::<ListQuery>())
    .and(with_node(node.clone()))
    .and_then(handle_list_servers);

  let set_enabled = warp::path!("servers" / ServerId / "enabled")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_node(node.clone()))
    .and_then(handle_set_server_enabled);

  let farm_get = warp::path!("farm" / "enabled")
    .and(warp::get())
    .and(with_node(node.clone()))
    .and_then(handle_get_farm_enabled);

  let farm_set = warp::path!("farm" / "enabled")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_node(node))
    .and_then(handle_set_farm_enabled);

  list.or(set_enabled).or(farm_get).or(farm_set)
}

async fn handle_list_servers(query: ListQuery, node: Arc<FarmNode>) -> Result<impl warp::Reply, warp::Rejection> {
  let timeout = node.settings().offline_timeout;
  let now = Utc::now();
  let servers = node
    .registry()
    .list_servers(query.include_disabled)
    .await
    .map_err(reject)?;
  let views: Vec<ServerView> = servers
    .into_iter()
    .map(|server| ServerView {
      computed_status: compute_status(&server, now, timeout),
      server,
    })
    .collect();
  Ok(warp::reply::json(&views))
}

async fn handle_set_server_enabled(
  server_id: ServerId,
  flag: EnabledFlag,
  node: Arc<FarmNode>,
) -> Result<impl warp::Reply, warp::Rejection> {
  node
    .registry()
    .set_enabled(server_id, flag.enabled)
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&flag))
}

async fn handle_get_farm_enabled(node: Arc<FarmNode>) -> Result<impl warp::Reply, warp::Rejection> {
  let enabled = node
    .registry()
    .store()
    .get_flag(FLAG_FARM_ENABLED)
    .await
    .map_err(reject)?
    .unwrap_or(true);
  Ok(warp::reply::json(&EnabledFlag { enabled }))
}

async fn handle_set_farm_enabled(flag: EnabledFlag, node: Arc<FarmNode>) -> Result<impl warp::Reply, warp::Rejection> {
  node
    .registry()
    .store()
    .set_flag(FLAG_FARM_ENABLED, flag.enabled)
    .await
    .map_err(reject)?;
  info!(enabled = flag.enabled, "Farm synchronization flag changed");
  Ok(warp::reply::json(&flag))
}
