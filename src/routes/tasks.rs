use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use warp::Filter;

use super::{ApiError, reject, with_node};
use crate::models::{SequenceId, ServerId, TaskLogEntry, TaskTarget};
use crate::node::FarmNode;

const MAX_PAGE: usize = 1000;

#[derive(Debug, Deserialize, Serialize)]
pub struct NewTask {
  pub type_name: String,
  /// Omitted means every other enabled server.
  pub target: Option<ServerId>,
  #[serde(default)]
  pub text_parameters: Vec<String>,
  pub binary_payload_b64: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
  pub sequence_id: Option<SequenceId>,
  pub broadcast: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
  #[serde(default)]
  pub since: SequenceId,
  pub limit: Option<usize>,
}

pub fn tasks_routes(node: Arc<FarmNode>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  let submit = warp::path!("tasks")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_node(node.clone()))
    .and_then(handle_submit_task);

  let list = warp::path!("tasks")
    .and(warp::get())
    .and(warp::query::<LogQuery>())
    .and(with_node(node))
    .and_then(handle_list_tasks);

  submit.or(list)
}

async fn handle_submit_task(new_task: NewTask, node: Arc<FarmNode>) -> Result<impl warp::Reply, warp::Rejection> {
  let payload = match &new_task.binary_payload_b64 {
    Some(encoded) => Some(
      BASE64
        .decode(encoded)
        .map_err(|e| reject(ApiError::bad_request(format!("binary_payload_b64 is not base64: {}", e))))?,
    ),
    None => None,
  };
  let target = TaskTarget::from_server_id(new_task.target);
  let dispatcher = node.dispatcher();

  // a targeted task is meant for another node only, so there is nothing to apply here
  let result = match target {
    TaskTarget::AllServers => {
      dispatcher
        .apply_and_broadcast(&new_task.type_name, target, new_task.text_parameters, payload)
        .await
    }
    TaskTarget::Server(_) => dispatcher
      .broadcast(&new_task.type_name, target, new_task.text_parameters, payload)
      .await
      .map_err(anyhow::Error::from),
  };

  let sequence_id = result.map_err(|e| {
    error!(type_name = %new_task.type_name, "Task submission failed: {:#}", e);
    reject(ApiError::from_anyhow(e))
  })?;

  info!(type_name = %new_task.type_name, ?sequence_id, "Task submitted");
  Ok(warp::reply::json(&TaskResponse {
    sequence_id,
    broadcast: sequence_id.is_some(),
  }))
}

async fn handle_list_tasks(query: LogQuery, node: Arc<FarmNode>) -> Result<impl warp::Reply, warp::Rejection> {
  let limit = query.limit.unwrap_or(100).min(MAX_PAGE);
  let entries: Vec<TaskLogEntry> = node
    .task_log()
    .read_since(query.since, limit)
    .await
    .map_err(reject)?;
  Ok(warp::reply::json(&entries))
}
