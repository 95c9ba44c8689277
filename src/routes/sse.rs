use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use warp::Filter;

use super::with_node;
use crate::node::FarmNode;

pub fn sse_route(node: Arc<FarmNode>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("status" / "sse")
    .and(warp::get())
    .and(with_node(node))
    .and_then(handle_sse)
}

async fn handle_sse(node: Arc<FarmNode>) -> Result<impl warp::Reply, warp::Rejection> {
  let stream = BroadcastStream::new(node.subscribe_status()).filter_map(|change| match change {
    Ok(change) => {
      let event = warp::sse::Event::default()
        .event("status_change")
        .json_data(&change)
        .ok()?;
      Some(Ok::<_, Infallible>(event))
    }
    Err(lagged) => {
      debug!("Status stream subscriber lagged: {}", lagged);
      None
    }
  });

  Ok(warp::sse::reply(
    warp::sse::keep_alive()
      .interval(Duration::from_secs(15))
      .stream(stream),
  ))
}
