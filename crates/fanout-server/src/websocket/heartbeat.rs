//! Heartbeat liveness monitoring.
//!
//! The session's writer sends a Ping every interval; the reader marks the
//! connection alive on any inbound frame. This loop only watches the flag.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stopped responding within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Shortest period any session timer ticks at.
const MIN_TICK: Duration = Duration::from_millis(1);

/// An interval ticking every `period`, clamped to [`MIN_TICK`].
pub(crate) fn ticker(period: Duration) -> time::Interval {
    time::interval(period.max(MIN_TICK))
}

/// Number of consecutive silent ticks tolerated before timing out.
fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Watch a connection's alive flag until it goes silent or `cancel` fires.
///
/// At each `interval` tick the flag is checked and reset. Once
/// `timeout / interval` consecutive ticks (at least one) pass without the
/// peer being heard from, [`HeartbeatResult::TimedOut`] is returned.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = ticker(interval);
    // The first tick completes immediately; the peer has had no chance yet.
    let _ = check_interval.tick().await;
    let mut missed: u32 = 0;
    let limit = max_missed(interval, timeout);

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= limit {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_core::ConnectionId;
    use tokio::sync::mpsc;

    fn make_connection() -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Connection::new(
            ConnectionId::from_raw(1),
            tx,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn max_missed_from_ratio() {
        assert_eq!(
            max_missed(Duration::from_millis(100), Duration::from_millis(300)),
            3
        );
        assert_eq!(max_missed(Duration::from_secs(30), Duration::from_secs(90)), 3);
    }

    #[test]
    fn max_missed_at_least_one() {
        assert_eq!(
            max_missed(Duration::from_secs(10), Duration::from_secs(1)),
            1
        );
        assert_eq!(max_missed(Duration::ZERO, Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn ticker_clamps_zero_period() {
        assert_eq!(ticker(Duration::ZERO).period(), MIN_TICK);
        assert_eq!(
            ticker(Duration::from_millis(5)).period(),
            Duration::from_millis(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_still_runs() {
        let conn = make_connection();
        let _ = conn.check_alive();
        let result =
            run_heartbeat(conn, Duration::ZERO, Duration::ZERO, CancellationToken::new()).await;
        assert_eq!(result, HeartbeatResult::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_first_check() {
        let conn = make_connection();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_heartbeat(
            conn,
            Duration::from_secs(100),
            Duration::from_secs(300),
            cancel,
        )
        .await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let conn = make_connection();
        // Consume the initial alive flag so the first tick already misses.
        let _ = conn.check_alive();
        let started = time::Instant::now();

        let result = run_heartbeat(
            conn,
            Duration::from_millis(100),
            Duration::from_millis(300),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(result, HeartbeatResult::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_peer_stays_alive() {
        let conn = make_connection();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            conn.clone(),
            Duration::from_millis(100),
            Duration::from_millis(200),
            cancel.clone(),
        ));

        for _ in 0..10 {
            time::sleep(Duration::from_millis(50)).await;
            conn.mark_alive();
        }

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_missed_count() {
        let conn = make_connection();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            conn.clone(),
            Duration::from_millis(100),
            Duration::from_millis(300),
            cancel.clone(),
        ));

        // Misses at 200ms and 400ms are split by activity at 250ms.
        time::sleep(Duration::from_millis(250)).await;
        conn.mark_alive();
        time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }
}
