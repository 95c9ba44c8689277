use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{info, warn};

use crate::error::StoreResult;

static MIGRATOR: Migrator = sqlx::migrate!();

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

pub async fn setup_database(database_url: &str) -> StoreResult<Pool<Postgres>> {
  let pool = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    Pool::<Postgres>::connect(database_url).await.inspect_err(|e| {
      warn!("Database connection attempt failed: {}", e);
    })
  })
    .await?;

  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}
