use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::limits::MAX_TRACKED_CALLERS;
use crate::model::Ms;
use crate::observability;

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Ms,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

/// Fixed-window request counter per caller key. `max == 0` turns throttling off.
///
/// At most `max_tracked` keys are held. A new key arriving while the table is full of live
/// windows is limited until some window rolls over.
pub struct RateLimiter {
    max: u32,
    window_ms: Ms,
    max_tracked: usize,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window_ms: window.as_millis() as Ms,
            max_tracked: MAX_TRACKED_CALLERS,
            windows: DashMap::new(),
        }
    }

    pub fn check(&self, key: &str, now: Ms) -> Decision {
        if self.max == 0 {
            return Decision::Allowed;
        }
        if self.windows.len() >= self.max_tracked && !self.windows.contains_key(key) {
            self.prune(now);
            if self.windows.len() >= self.max_tracked {
                return Decision::Limited {
                    retry_after_secs: self.oldest_rollover_secs(now),
                };
            }
        }

        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now - window.started_at >= self.window_ms {
            *window = Window {
                started_at: now,
                count: 0,
            };
        }
        if window.count >= self.max {
            let remaining_ms = window.started_at + self.window_ms - now;
            return Decision::Limited {
                retry_after_secs: (remaining_ms.max(0) as u64).div_ceil(1_000).max(1),
            };
        }
        window.count += 1;
        Decision::Allowed
    }

    /// Drop windows that have already rolled over.
    fn prune(&self, now: Ms) {
        self.windows
            .retain(|_, window| now - window.started_at < self.window_ms);
    }

    /// Seconds until the oldest tracked window rolls over and frees its entry.
    fn oldest_rollover_secs(&self, now: Ms) -> u64 {
        let oldest = self
            .windows
            .iter()
            .map(|entry| entry.value().started_at)
            .min()
            .unwrap_or(now);
        ((oldest + self.window_ms - now).max(0) as u64)
            .div_ceil(1_000)
            .max(1)
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// State for one throttled route group.
pub struct Throttle {
    pub limiter: RateLimiter,
    pub route: &'static str,
    pub clock: Arc<dyn Clock>,
}

/// Caller identity for throttling: the peer address. Cookies are caller-chosen and never
/// pick the bucket.
fn caller_key(request: &Request) -> String {
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => "anonymous".to_string(),
    }
}

pub async fn throttle(State(throttle): State<Arc<Throttle>>, request: Request, next: Next) -> Response {
    let key = caller_key(&request);
    match throttle.limiter.check(&key, throttle.clock.now_ms()) {
        Decision::Allowed => next.run(request).await,
        Decision::Limited { retry_after_secs } => {
            tracing::warn!(route = throttle.route, caller = %key, "rate limited");
            metrics::counter!(observability::RATE_LIMITED_TOTAL, "route" => throttle.route)
                .increment(1);
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({ "error": "rate_limited" })),
            )
                .into_response();
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
            response
        }
    }
}
