//! Optional liveness beacon.
//!
//! When `heartbeat.url` is configured, each syncer POSTs a small JSON
//! document to the collector at the configured interval. The beacon is
//! monitoring glue only: failures log at warn and never touch the
//! replication pipeline.

use crate::config::HeartbeatConfig;
use crate::error::Result;
use crate::status::StatusView;
use crate::syncer::SyncerShared;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// POST liveness documents until the process dies. Infallible by design.
pub async fn run_heartbeat(
    config: HeartbeatConfig,
    shared: Arc<SyncerShared>,
    status: StatusView,
) -> Result<()> {
    let interval_duration = config.interval_duration();

    let url = match config.url {
        Some(url) => url,
        None => return Ok(()),
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(syncer_id = shared.id, error = %e, "heartbeat client unavailable");
            return Ok(());
        }
    };

    let mut timer = tokio::time::interval(interval_duration);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        timer.tick().await;

        let stat = shared.stat();
        let body = serde_json::json!({
            "syncer": shared.id,
            "source": shared.source,
            "target": shared.target,
            "status": status.get().as_str(),
            "applied_offset": shared.applied_offset(),
            "source_offset": shared.source_offset(),
            "forward": stat.forward,
            "nbypass": stat.nbypass,
        });

        match client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                trace!(syncer_id = shared.id, "heartbeat delivered");
            }
            Ok(resp) => {
                warn!(
                    syncer_id = shared.id,
                    status = %resp.status(),
                    "heartbeat collector rejected beacon"
                );
            }
            Err(e) => {
                warn!(syncer_id = shared.id, error = %e, "heartbeat delivery failed");
            }
        }
    }
}
