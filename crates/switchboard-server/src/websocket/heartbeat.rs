//! Heartbeat liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client showed no activity for the whole timeout window.
    TimedOut,
    /// The connection was closed or the server is shutting down.
    Cancelled,
}

/// Watch a connection's liveness flag until it goes quiet or `cancel` fires.
///
/// Every `interval` the alive flag is checked and reset. Each tick without
/// activity since the previous one counts as a miss; `timeout / interval`
/// consecutive misses (at least one) end the loop with
/// [`HeartbeatResult::TimedOut`]. The caller decides what to do with a dead
/// connection.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let max_missed = max_missed(interval, timeout);
    let interval = interval.max(Duration::from_millis(1));
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick is immediate; skip it so a fresh connection gets a full interval.
    let _ = ticker.tick().await;
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
        }
    }
}

fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1)
}
