//! Sweep loop: periodically discards stalled partial transfers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use voxmesh_services::InboundRouter;

/// Sweep at half the receive timeout so a stalled transfer is dropped no
/// later than 1.5× the timeout after its last chunk.
pub fn interval_for(receive_timeout: Duration) -> Duration {
    (receive_timeout / 2).max(Duration::from_secs(1))
}

pub async fn sweep_loop(
    router: Arc<InboundRouter>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    // First tick completes immediately; nothing can be stale yet.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("sweep loop shutting down");
                return;
            }
            _ = interval.tick() => {
                let dropped = router.sweep(tokio::time::Instant::now()).await;
                if dropped > 0 {
                    tracing::info!(dropped, "timed out incomplete messages");
                }
            }
        }
    }
}
