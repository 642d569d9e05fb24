use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{instrument, trace, warn};

use crate::util::crypto::unix_timestamp;

use super::session::Outbound;

/// Emit one status telemetry message per period.
///
/// Messages are queued on the serialized sender rather than published
/// directly. When the queue is full (a slow or dropped transport) the
/// tick is skipped with a warning and the next tick produces a fresh
/// message, so a connection gap never results in a burst of stale
/// heartbeats.
#[instrument(name = "heartbeat", skip_all)]
pub async fn start_heartbeat(
    device_id: String,
    period: Duration,
    outbound_tx: mpsc::Sender<Outbound>,
) {
    // first beat goes out immediately after connecting
    let mut next_beat = Instant::now();

    loop {
        sleep_until(next_beat).await;

        let payload = json!({
            "deviceId": device_id,
            "timestamp": unix_timestamp(),
            "status": "alive",
        });

        match outbound_tx.try_send(Outbound::Telemetry(payload)) {
            Ok(()) => trace!("heartbeat queued"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("publish queue full, skipping heartbeat")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }

        next_beat = Instant::now() + period;
    }
}
