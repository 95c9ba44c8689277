use std::convert::Infallible;
use std::sync::Arc;

use serde_json::json;
use tracing::error;
use warp::Filter;
use warp::http::StatusCode;

use crate::error::{FarmError, StoreError};
use crate::node::FarmNode;

pub mod servers;
pub mod sse;
pub mod tasks;

pub fn routes(node: Arc<FarmNode>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  servers::servers_routes(node.clone())
    .or(tasks::tasks_routes(node.clone()))
    .or(sse::sse_route(node))
}

pub(crate) fn with_node(node: Arc<FarmNode>) -> impl Filter<Extract = (Arc<FarmNode>,), Error = Infallible> + Clone {
  warp::any().map(move || node.clone())
}

#[derive(Debug)]
pub struct ApiError {
  pub status: StatusCode,
  pub message: String,
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
    Self {
      status,
      message: message.into(),
    }
  }

  pub fn bad_request(message: impl Into<String>) -> Self {
    Self::new(StatusCode::BAD_REQUEST, message)
  }

  /// Maps engine errors to statuses; anything else is a failed local apply.
  pub fn from_anyhow(err: anyhow::Error) -> Self {
    match err.downcast::<FarmError>() {
      Ok(farm) => farm.into(),
      Err(other) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, format!("{:#}", other)),
    }
  }
}

impl From<FarmError> for ApiError {
  fn from(err: FarmError) -> Self {
    let status = match &err {
      FarmError::UnregisteredTaskType(_) | FarmError::InvalidTarget(_) | FarmError::InvalidTaskTypeName(_) => {
        StatusCode::BAD_REQUEST
      }
      FarmError::UnknownServer(_) | FarmError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
      FarmError::DuplicateTaskType(_) => StatusCode::CONFLICT,
      FarmError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    Self::new(status, err.to_string())
  }
}

impl From<StoreError> for ApiError {
  fn from(err: StoreError) -> Self {
    FarmError::from(err).into()
  }
}

pub(crate) fn reject(err: impl Into<ApiError>) -> warp::Rejection {
  warp::reject::custom(err.into())
}

pub async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (status, message) = if let Some(api) = err.find::<ApiError>() {
    (api.status, api.message.clone())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not found".to_string())
  } else if let Some(body) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, body.to_string())
  } else if err.find::<warp::reject::InvalidQuery>().is_some() {
    (StatusCode::BAD_REQUEST, "invalid query string".to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}
