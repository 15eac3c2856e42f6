use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    middleware,
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::admission::{RenewResult, StatusResult};
use crate::client::DEFAULT_POLL_INTERVAL;
use crate::model::ResourceId;

use super::cookies::read_token;
use super::guard::{Admitted, admission_guard};
use super::rate_limit::{RateLimiter, Throttle, throttle};
use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
struct WaitQuery {
    #[serde(rename = "resourceId")]
    resource_id: Option<String>,
}

/// The gated resource itself. Only reached through [`admission_guard`].
async fn resource(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Extension(admitted): Extension<Admitted>,
) -> Result<Json<Value>, ApiError> {
    let resource_id = ResourceId::parse(&raw_id)?;
    Ok(Json(json!({
        "resourceId": resource_id.as_str(),
        "slot": admitted.lease.map(|lease| lease.slot),
        "expiresAt": admitted.lease.map(|lease| lease.expires_at),
        "heartbeatSeconds": state.admission.config().heartbeat_seconds,
    })))
}

/// Descriptor for the waiting page: where and how often to poll.
async fn wait(Query(query): Query<WaitQuery>) -> Result<Json<Value>, ApiError> {
    let resource_id = ResourceId::parse(query.resource_id.as_deref().unwrap_or_default())?;
    Ok(Json(json!({
        "resourceId": resource_id.as_str(),
        "pollSeconds": DEFAULT_POLL_INTERVAL.as_secs(),
        "statusUrl": format!("/api/resources/{resource_id}/presence/status"),
    })))
}

async fn presence_status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StatusResult>, ApiError> {
    let config = state.admission.config();
    if !config.enabled {
        return Ok(Json(StatusResult::open(config.capacity)));
    }
    let resource_id = ResourceId::parse(&raw_id)?;
    let token = read_token(&headers).ok();
    let status = state
        .admission
        .status
        .status(&resource_id, token.as_ref(), state.clock.now_ms())
        .await?;
    Ok(Json(status))
}

async fn presence_heartbeat(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    if !state.admission.config().enabled {
        return Ok(Json(json!({ "ok": true, "disabled": true })));
    }
    let resource_id = ResourceId::parse(&raw_id)?;
    let token = read_token(&headers)?;

    let renewed = state
        .admission
        .heartbeat
        .renew(&resource_id, &token, state.clock.now_ms())
        .await?;
    Ok(Json(match renewed {
        RenewResult::Renewed { expires_at } => json!({ "ok": true, "expiresAt": expires_at }),
        RenewResult::NoSlot => json!({ "ok": false, "reason": "no_slot" }),
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let config = state.admission.config();
    Json(json!({
        "status": "ok",
        "enabled": config.enabled,
        "capacity": config.capacity,
    }))
}

/// Status and heartbeat each get their own per-caller limiter of `rate_limit_max` requests per
/// `rate_limit_window`.
pub fn routes(state: AppState, rate_limit_max: u32, rate_limit_window: Duration) -> Router {
    let limiter = |route: &'static str| {
        Arc::new(Throttle {
            limiter: RateLimiter::new(rate_limit_max, rate_limit_window),
            route,
            clock: state.clock.clone(),
        })
    };

    let gated = Router::new()
        .route("/resources/{id}", get(resource))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission_guard,
        ));
    let status = Router::new()
        .route("/api/resources/{id}/presence/status", get(presence_status))
        .route_layer(middleware::from_fn_with_state(limiter("status"), throttle));
    let heartbeat = Router::new()
        .route(
            "/api/resources/{id}/presence/heartbeat",
            post(presence_heartbeat),
        )
        .route_layer(middleware::from_fn_with_state(limiter("heartbeat"), throttle));

    Router::new()
        .route("/wait", get(wait))
        .route("/health", get(health))
        .merge(gated)
        .merge(status)
        .merge(heartbeat)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use crate::admission::testing::*;
    use crate::clock::ManualClock;
    use crate::config::AdmissionConfig;
    use crate::http::TOKEN_COOKIE;
    use crate::model::Token;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::header::{COOKIE, LOCATION, RETRY_AFTER, SET_COOKIE};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn test_app(name: &str, config: AdmissionConfig, rate_limit_max: u32) -> (Router, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let state = AppState {
            admission: Arc::new(Admission::new(test_engine(name), config)),
            clock: clock.clone(),
            cookie_secure: false,
        };
        (routes(state, rate_limit_max, Duration::from_secs(15)), clock)
    }

    fn enabled(capacity: u32, ttl_seconds: u32) -> AdmissionConfig {
        AdmissionConfig::new(true, capacity, ttl_seconds, 15).unwrap()
    }

    fn cookie(token: &Token) -> String {
        format!("{TOKEN_COOKIE}={token}")
    }

    fn get_req(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::get(uri);
        if let Some(c) = cookie {
            builder = builder.header(COOKIE, c);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::post(uri);
        if let Some(c) = cookie {
            builder = builder.header(COOKIE, c);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn issued_token(response: &Response) -> Option<Token> {
        let header = response.headers().get(SET_COOKIE)?.to_str().ok()?;
        let value = header.split(';').next()?.strip_prefix("slot_token=")?;
        Token::parse(value).ok()
    }

    /// Visit a gated resource with no cookie and return the issued token.
    async fn enter(app: &Router, resource: &str) -> (StatusCode, Token) {
        let response = app
            .clone()
            .oneshot(get_req(&format!("/resources/{resource}"), None))
            .await
            .unwrap();
        let token = issued_token(&response).expect("guard issues a cookie");
        (response.status(), token)
    }

    #[tokio::test]
    async fn health_reports_configuration() {
        let (app, _) = test_app("http_health", enabled(7, 45), 60);
        let response = app.oneshot(get_req("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response_json(response).await,
            json!({"status": "ok", "enabled": true, "capacity": 7})
        );
    }

    #[tokio::test]
    async fn first_visitor_is_admitted_with_a_cookie() {
        let (app, _) = test_app("http_admit", enabled(1, 45), 60);

        let response = app
            .clone()
            .oneshot(get_req("/resources/suite-1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap().to_string();
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("SameSite=Lax"));

        let json = response_json(response).await;
        assert_eq!(json["resourceId"], "suite-1");
        assert_eq!(json["slot"], 1);
        assert_eq!(json["expiresAt"], T0 + 45 * S);
        assert_eq!(json["heartbeatSeconds"], 15);
    }

    #[tokio::test]
    async fn full_resource_redirects_to_wait_page() {
        let (app, _) = test_app("http_redirect", enabled(1, 45), 60);
        let (status, holder) = enter(&app, "suite-1").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = enter(&app, "suite-1").await;
        assert_eq!(status, StatusCode::SEE_OTHER);
        let response = app
            .clone()
            .oneshot(get_req("/resources/suite-1", None))
            .await
            .unwrap();
        assert_eq!(response.headers()[LOCATION], "/wait?resourceId=suite-1");

        // The holder keeps getting in without a new cookie
        let again = app
            .clone()
            .oneshot(get_req("/resources/suite-1", Some(&cookie(&holder))))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        assert!(again.headers().get(SET_COOKIE).is_none());
        assert_eq!(response_json(again).await["slot"], 1);

        // Other resources are independent
        let (status, _) = enter(&app, "suite-2").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_cookie_is_replaced() {
        let (app, _) = test_app("http_malformed_cookie", enabled(2, 45), 60);
        let response = app
            .oneshot(get_req("/resources/suite-1", Some("slot_token=not-a-token")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(issued_token(&response).is_some());
    }

    #[tokio::test]
    async fn invalid_resource_id_is_rejected() {
        let (app, _) = test_app("http_bad_id", enabled(2, 45), 60);
        let response = app
            .clone()
            .oneshot(get_req("/resources/bad.id", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get_req("/api/resources/bad.id/presence/status", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wait_page_descriptor() {
        let (app, _) = test_app("http_wait", enabled(1, 45), 60);
        let response = app
            .clone()
            .oneshot(get_req("/wait?resourceId=suite-1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response_json(response).await,
            json!({
                "resourceId": "suite-1",
                "pollSeconds": 4,
                "statusUrl": "/api/resources/suite-1/presence/status"
            })
        );

        for uri in ["/wait", "/wait?resourceId=", "/wait?resourceId=bad.id"] {
            let response = app.clone().oneshot(get_req(uri, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn status_reflects_occupancy_per_caller() {
        let (app, _) = test_app("http_status", enabled(1, 45), 60);
        let (_, holder) = enter(&app, "suite-1").await;
        let waiter = Token::issue();
        let uri = "/api/resources/suite-1/presence/status";

        let for_holder = app
            .clone()
            .oneshot(get_req(uri, Some(&cookie(&holder))))
            .await
            .unwrap();
        assert_eq!(
            response_json(for_holder).await,
            json!({"active": 1, "capacity": 1, "canEnter": true})
        );

        let for_waiter = app
            .clone()
            .oneshot(get_req(uri, Some(&cookie(&waiter))))
            .await
            .unwrap();
        assert_eq!(response_json(for_waiter).await["canEnter"], false);

        let anonymous = app.oneshot(get_req(uri, None)).await.unwrap();
        assert_eq!(anonymous.status(), StatusCode::OK);
        assert_eq!(response_json(anonymous).await["canEnter"], false);
    }

    #[tokio::test]
    async fn heartbeat_responses() {
        let (app, clock) = test_app("http_heartbeat", enabled(1, 45), 60);
        let (_, holder) = enter(&app, "suite-1").await;
        let uri = "/api/resources/suite-1/presence/heartbeat";

        let no_cookie = app.clone().oneshot(post_req(uri, None)).await.unwrap();
        assert_eq!(no_cookie.status(), StatusCode::UNAUTHORIZED);

        let malformed = app
            .clone()
            .oneshot(post_req(uri, Some("slot_token=garbage")))
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let stranger = app
            .clone()
            .oneshot(post_req(uri, Some(&cookie(&Token::issue()))))
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::OK);
        assert_eq!(
            response_json(stranger).await,
            json!({"ok": false, "reason": "no_slot"})
        );

        clock.advance(10 * S);
        let renewed = app
            .oneshot(post_req(uri, Some(&cookie(&holder))))
            .await
            .unwrap();
        assert_eq!(
            response_json(renewed).await,
            json!({"ok": true, "expiresAt": T0 + 55 * S})
        );
    }

    /// Capacity 1, TTL 3 s, over HTTP.
    #[tokio::test]
    async fn lease_lapses_without_heartbeat() {
        let (app, clock) = test_app("http_timeline", enabled(1, 3), 60);
        let heartbeat = |token: Token| {
            app.clone().oneshot(post_req(
                "/api/resources/suite-1/presence/heartbeat",
                Some(&cookie(&token)),
            ))
        };

        let (status, a) = enter(&app, "suite-1").await;
        assert_eq!(status, StatusCode::OK);

        clock.set(T0 + 100);
        let (status, b) = enter(&app, "suite-1").await;
        assert_eq!(status, StatusCode::SEE_OTHER);
        let b_visit = |app: Router| {
            app.oneshot(get_req("/resources/suite-1", Some(&cookie(&b))))
        };

        clock.set(T0 + 1_800);
        let renewed = response_json(heartbeat(a).await.unwrap()).await;
        assert_eq!(renewed["expiresAt"], T0 + 4_800);

        clock.set(T0 + 3_500);
        assert_eq!(b_visit(app.clone()).await.unwrap().status(), StatusCode::SEE_OTHER);

        clock.set(T0 + 5_000);
        let admitted = b_visit(app.clone()).await.unwrap();
        assert_eq!(admitted.status(), StatusCode::OK);
        assert_eq!(response_json(admitted).await["slot"], 1);

        let lost = response_json(heartbeat(a).await.unwrap()).await;
        assert_eq!(lost, json!({"ok": false, "reason": "no_slot"}));
    }

    #[tokio::test]
    async fn disabled_admission_passes_everything() {
        let config = AdmissionConfig::new(false, 1, 45, 15).unwrap();
        let (app, _) = test_app("http_disabled", config, 60);

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(get_req("/resources/suite-1", None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(SET_COOKIE).is_none());
            let json = response_json(response).await;
            assert!(json["slot"].is_null());
            assert!(json["expiresAt"].is_null());
        }

        let status = app
            .clone()
            .oneshot(get_req("/api/resources/suite-1/presence/status", None))
            .await
            .unwrap();
        assert_eq!(
            response_json(status).await,
            json!({"active": 0, "capacity": 1, "canEnter": true})
        );

        let heartbeat = app
            .clone()
            .oneshot(post_req("/api/resources/suite-1/presence/heartbeat", None))
            .await
            .unwrap();
        assert_eq!(
            response_json(heartbeat).await,
            json!({"ok": true, "disabled": true})
        );

        // The switch is checked before the id
        let status = app
            .oneshot(get_req("/api/resources/bad.id/presence/status", None))
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        assert_eq!(response_json(status).await["canEnter"], true);
    }

    #[tokio::test]
    async fn presence_calls_are_throttled_per_route() {
        let (app, clock) = test_app("http_throttle", enabled(1, 45), 2);
        let caller = cookie(&Token::issue());
        let status_uri = "/api/resources/suite-1/presence/status";

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(get_req(status_uri, Some(&caller)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let limited = app
            .clone()
            .oneshot(get_req(status_uri, Some(&caller)))
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.headers()[RETRY_AFTER], "15");

        // Heartbeats have their own budget
        let heartbeat = app
            .clone()
            .oneshot(post_req(
                "/api/resources/suite-1/presence/heartbeat",
                Some(&caller),
            ))
            .await
            .unwrap();
        assert_eq!(heartbeat.status(), StatusCode::OK);

        clock.advance(15 * S);
        let after_window = app
            .oneshot(get_req(status_uri, Some(&caller)))
            .await
            .unwrap();
        assert_eq!(after_window.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rotating_cookies_share_the_peer_budget() {
        let (app, _) = test_app("http_throttle_peer", enabled(1, 45), 2);
        let from = |ip: [u8; 4], header: String| {
            let mut request = get_req("/api/resources/suite-1/presence/status", Some(header.as_str()));
            request
                .extensions_mut()
                .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
            app.clone().oneshot(request)
        };

        for i in 0..2 {
            let response = from([10, 0, 0, 1], format!("slot_token=garbage{i}")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let fresh_cookie = from([10, 0, 0, 1], cookie(&Token::issue())).await.unwrap();
        assert_eq!(fresh_cookie.status(), StatusCode::TOO_MANY_REQUESTS);

        let other_peer = from([10, 0, 0, 2], "slot_token=garbage0".into()).await.unwrap();
        assert_eq!(other_peer.status(), StatusCode::OK);
    }
}
