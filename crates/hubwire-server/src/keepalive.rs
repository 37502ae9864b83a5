//! Keep-alive and client-timeout policy.
//!
//! The drain task ticks at [`tick_period`] and asks [`evaluate`] what to do.
//! Keeping the decision pure lets it be tested without a transport.

use std::time::Duration;

use tokio::time::Instant;

/// Upper bound on the tick period; long intervals are still checked at
/// this granularity.
const MAX_TICK: Duration = Duration::from_secs(1);

/// What the drain task should do on a keep-alive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Traffic is recent enough.
    Idle,
    /// Nothing was exchanged for a full interval; write a ping.
    SendPing,
    /// The client has been silent past the timeout.
    TimedOut,
}

/// Traffic timestamps and limits for one connection.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveState {
    /// Last time bytes were written to the transport.
    pub last_send: Instant,
    /// Last time bytes arrived from the client.
    pub last_receive: Instant,
    /// Idle time before a ping.
    pub interval: Duration,
    /// Inbound silence before abort.
    pub client_timeout: Duration,
}

/// Decide the action for a tick at `now`.
///
/// Inbound traffic resets both windows: a client that is talking does not
/// need a ping to learn the connection is alive.
pub fn evaluate(state: &KeepAliveState, now: Instant) -> KeepAliveAction {
    if now.saturating_duration_since(state.last_receive) >= state.client_timeout {
        return KeepAliveAction::TimedOut;
    }
    let last_activity = state.last_send.max(state.last_receive);
    if now.saturating_duration_since(last_activity) >= state.interval {
        KeepAliveAction::SendPing
    } else {
        KeepAliveAction::Idle
    }
}

/// How often the drain task evaluates keep-alive.
pub fn tick_period(interval: Duration) -> Duration {
    interval.min(MAX_TICK).max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(now: Instant) -> KeepAliveState {
        KeepAliveState {
            last_send: now,
            last_receive: now,
            interval: Duration::from_secs(15),
            client_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_connection_is_idle() {
        let now = Instant::now();
        assert_eq!(evaluate(&state(now), now), KeepAliveAction::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_interval_sends_ping() {
        let start = Instant::now();
        let s = state(start);
        let later = start + Duration::from_secs(15);
        assert_eq!(evaluate(&s, later), KeepAliveAction::SendPing);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_send_suppresses_ping() {
        let start = Instant::now();
        let mut s = state(start);
        s.last_send = start + Duration::from_secs(10);
        assert_eq!(evaluate(&s, start + Duration::from_secs(16)), KeepAliveAction::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_receive_suppresses_ping() {
        let start = Instant::now();
        let mut s = state(start);
        s.last_receive = start + Duration::from_secs(10);
        assert_eq!(evaluate(&s, start + Duration::from_secs(16)), KeepAliveAction::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out_even_if_server_talks() {
        let start = Instant::now();
        let mut s = state(start);
        s.last_send = start + Duration::from_secs(29);
        assert_eq!(
            evaluate(&s, start + Duration::from_secs(30)),
            KeepAliveAction::TimedOut
        );
    }

    #[test]
    fn tick_period_is_capped() {
        assert_eq!(tick_period(Duration::from_secs(15)), Duration::from_secs(1));
        assert_eq!(tick_period(Duration::from_millis(50)), Duration::from_millis(50));
        assert_eq!(tick_period(Duration::ZERO), Duration::from_millis(1));
    }
}
