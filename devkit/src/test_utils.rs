/*!
Utilitaires de test async

Remplacent les `sleep` arbitraires des tests par une attente bornée sur une
condition observable.
*/

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Active les logs (`RUST_LOG`) une seule fois par binaire de test
pub fn init_test_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Attend que `condition` devienne vraie ; `false` si le délai expire
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            log::warn!("⏰ condition not met within {limit:?}");
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Attend un futur avec une erreur explicite en cas de dépassement
pub async fn expect_within<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    timeout(limit, fut).await.map_err(|_| anyhow!("timed out after {limit:?}"))
}
