use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use harbor_db::Database;

/// Background task that prunes expired-or-revoked refresh tokens and stale
/// pending registrations.
///
/// Expiry is always enforced at use time; the sweep only bounds storage
/// growth, so a failed pass is logged and the loop keeps going.
pub async fn run_sweep_loop(db: Arc<Database>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match sweep(&db).await {
            Ok((tokens, pending)) => {
                if tokens > 0 || pending > 0 {
                    info!(
                        "Sweep: removed {} refresh tokens, {} pending registrations",
                        tokens, pending
                    );
                }
            }
            Err(e) => {
                warn!("Sweep error: {:#}", e);
            }
        }
    }
}

async fn sweep(db: &Arc<Database>) -> anyhow::Result<(usize, usize)> {
    let now = Utc::now().timestamp_millis();
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let tokens = db.sweep_refresh_tokens(now)?;
        let pending = db.sweep_pending_registrations(now)?;
        Ok((tokens, pending))
    })
    .await
    .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?
}
