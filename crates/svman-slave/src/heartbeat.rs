//! Active slave → master heartbeat

use std::time::Duration;

use svman_infra::NodeChannel;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::link::{MasterLink, SessionError};

/// Heartbeat the master every `interval` until one fails
///
/// The first heartbeat goes out one interval after the call. Any failure
/// ends the loop and is returned; the caller tears the session down.
pub async fn heartbeat_loop(
    link: &dyn MasterLink,
    channel: &NodeChannel,
    interval: Duration,
) -> SessionError {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sent: u64 = 0;
    loop {
        ticker.tick().await;
        match link.heartbeat(channel).await {
            Ok(()) => {
                sent += 1;
                debug!(sent, "heartbeat acknowledged by master");
            }
            Err(e) => {
                warn!(error = %e, sent, "heartbeat to master failed");
                return e;
            }
        }
    }
}
