//! Caller-side pacing for the waiting page and the heartbeat that keeps a held slot alive.
//!
//! Transport is left to the caller: the loops take a closure that performs one request and
//! reports what came back.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::Value;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

/// Status poll cadence advertised by `/wait`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive error responses before the slot is considered lost.
const ERROR_RESPONSE_LIMIT: u32 = 2;
/// Consecutive failures, counting network failures, before the slot is considered lost.
const NETWORK_FAILURE_LIMIT: u32 = 3;

/// What one heartbeat request produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Renewed,
    /// The server answered `ok: false`: no live slot for this token.
    NoSlot,
    RateLimited,
    ErrorStatus,
    NetworkFailure,
}

impl HeartbeatOutcome {
    /// Classify a heartbeat response from its status and parsed body (`None` when the body was
    /// not JSON).
    pub fn from_response(status: StatusCode, body: Option<&Value>) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return HeartbeatOutcome::RateLimited;
        }
        if !status.is_success() {
            return HeartbeatOutcome::ErrorStatus;
        }
        match body.and_then(|b| b.get("ok")).and_then(Value::as_bool) {
            Some(true) => HeartbeatOutcome::Renewed,
            _ => HeartbeatOutcome::NoSlot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    LostSlot,
}

/// Failure bookkeeping across heartbeats. Error responses and network failures share one
/// counter; each kind checks it against its own limit.
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    consecutive_failures: u32,
}

impl HeartbeatMonitor {
    pub fn record(&mut self, outcome: HeartbeatOutcome) -> Verdict {
        let limit = match outcome {
            HeartbeatOutcome::Renewed => {
                self.consecutive_failures = 0;
                return Verdict::Continue;
            }
            HeartbeatOutcome::NoSlot => return Verdict::LostSlot,
            HeartbeatOutcome::RateLimited => return Verdict::Continue,
            HeartbeatOutcome::ErrorStatus => ERROR_RESPONSE_LIMIT,
            HeartbeatOutcome::NetworkFailure => NETWORK_FAILURE_LIMIT,
        };
        self.consecutive_failures += 1;
        if self.consecutive_failures >= limit {
            Verdict::LostSlot
        } else {
            Verdict::Continue
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Poll interval from a server hint, never faster than [`MIN_POLL_INTERVAL`].
pub fn poll_interval(hint: Option<Duration>) -> Duration {
    hint.unwrap_or(DEFAULT_POLL_INTERVAL).max(MIN_POLL_INTERVAL)
}

/// Poll `check` immediately and then every `poll` until it reports `can_enter`. Failed polls are
/// logged and retried on the next tick. Returns the number of polls made.
pub async fn wait_until_admitted<F, Fut, E>(poll: Duration, mut check: F) -> u32
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
{
    let mut ticker = interval(poll_interval(Some(poll)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut polls = 0;
    loop {
        ticker.tick().await;
        polls += 1;
        match check().await {
            Ok(true) => return polls,
            Ok(false) => debug!(polls, "still waiting for a slot"),
            Err(e) => warn!(error = %e, "status poll failed, retrying"),
        }
    }
}

/// Send a heartbeat immediately and then every `every` until the slot is lost. Returns the
/// number of heartbeats sent.
pub async fn keep_alive<F, Fut>(every: Duration, mut send: F) -> u32
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HeartbeatOutcome>,
{
    let mut ticker = interval(every.max(MIN_HEARTBEAT_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut monitor = HeartbeatMonitor::default();
    let mut sent = 0;
    loop {
        ticker.tick().await;
        sent += 1;
        let outcome = send().await;
        if monitor.record(outcome) == Verdict::LostSlot {
            debug!(sent, ?outcome, "slot lost");
            return sent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;
    use super::HeartbeatOutcome::*;

    fn run(outcomes: &[HeartbeatOutcome]) -> Vec<Verdict> {
        let mut monitor = HeartbeatMonitor::default();
        outcomes.iter().map(|o| monitor.record(*o)).collect()
    }

    #[test]
    fn two_error_responses_lose_the_slot() {
        assert_eq!(
            run(&[ErrorStatus, ErrorStatus]),
            [Verdict::Continue, Verdict::LostSlot]
        );
    }

    #[test]
    fn three_network_failures_lose_the_slot() {
        assert_eq!(
            run(&[NetworkFailure, NetworkFailure, NetworkFailure]),
            [Verdict::Continue, Verdict::Continue, Verdict::LostSlot]
        );
    }

    #[test]
    fn failure_kinds_share_one_counter() {
        // network + error reaches the error limit
        assert_eq!(
            run(&[NetworkFailure, ErrorStatus]),
            [Verdict::Continue, Verdict::LostSlot]
        );
    }

    #[test]
    fn success_resets_and_rate_limits_are_ignored() {
        let mut monitor = HeartbeatMonitor::default();
        assert_eq!(monitor.record(ErrorStatus), Verdict::Continue);
        assert_eq!(monitor.record(RateLimited), Verdict::Continue);
        assert_eq!(monitor.consecutive_failures(), 1);
        assert_eq!(monitor.record(Renewed), Verdict::Continue);
        assert_eq!(monitor.consecutive_failures(), 0);
        assert_eq!(monitor.record(ErrorStatus), Verdict::Continue);
        assert_eq!(monitor.record(NoSlot), Verdict::LostSlot);
    }

    #[test]
    fn classify_responses() {
        let ok = serde_json::json!({"ok": true, "expiresAt": 1});
        let lost = serde_json::json!({"ok": false, "reason": "no_slot"});
        assert_eq!(HeartbeatOutcome::from_response(StatusCode::OK, Some(&ok)), Renewed);
        assert_eq!(HeartbeatOutcome::from_response(StatusCode::OK, Some(&lost)), NoSlot);
        assert_eq!(HeartbeatOutcome::from_response(StatusCode::OK, None), NoSlot);
        assert_eq!(
            HeartbeatOutcome::from_response(StatusCode::TOO_MANY_REQUESTS, None),
            RateLimited
        );
        assert_eq!(
            HeartbeatOutcome::from_response(StatusCode::UNAUTHORIZED, None),
            ErrorStatus
        );
    }

    #[test]
    fn poll_interval_has_a_floor() {
        assert_eq!(poll_interval(None), Duration::from_secs(4));
        assert_eq!(poll_interval(Some(Duration::from_secs(1))), Duration::from_secs(3));
        assert_eq!(poll_interval(Some(Duration::from_secs(10))), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_status_allows_entry() {
        let answers = Arc::new(Mutex::new(VecDeque::from([
            Ok(false),
            Err("unavailable"),
            Ok(true),
        ])));
        let start = Instant::now();
        let polls = wait_until_admitted(DEFAULT_POLL_INTERVAL, || {
            let answers = answers.clone();
            async move { answers.lock().unwrap().pop_front().unwrap() }
        })
        .await;
        assert_eq!(polls, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_continues_while_full() {
        let mut wait = tokio_test::task::spawn(wait_until_admitted(DEFAULT_POLL_INTERVAL, || async {
            Ok::<_, &str>(false)
        }));
        tokio_test::assert_pending!(wait.poll());
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio_test::assert_pending!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_stops_when_the_slot_is_lost() {
        let outcomes = Arc::new(Mutex::new(VecDeque::from([
            Renewed,
            RateLimited,
            ErrorStatus,
            Renewed,
            ErrorStatus,
            ErrorStatus,
        ])));
        let start = Instant::now();
        let sent = keep_alive(Duration::from_secs(15), || {
            let outcomes = outcomes.clone();
            async move { outcomes.lock().unwrap().pop_front().unwrap() }
        })
        .await;
        assert_eq!(sent, 6);
        assert_eq!(start.elapsed(), Duration::from_secs(75));
    }
}
