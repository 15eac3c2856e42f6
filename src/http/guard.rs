use axum::extract::{Path, Request, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::debug;

use crate::admission::AcquireResult;
use crate::model::*;

use super::cookies::{read_token, token_cookie};
use super::{ApiError, AppState};

/// Optional identity header set by an upstream authenticator.
const USER_ID_HEADER: &str = "x-user-id";

/// Inserted into request extensions once the guard lets a request through.
/// `lease` is `None` when admission is disabled.
#[derive(Debug, Clone, Copy)]
pub struct Admitted {
    pub lease: Option<Lease>,
}

/// Route layer for gated resources: grant a slot or redirect to the wait page.
pub async fn admission_guard(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    mut request: Request,
    next: Next,
) -> Response {
    if !state.admission.config().enabled {
        request.extensions_mut().insert(Admitted { lease: None });
        return next.run(request).await;
    }

    let resource_id = match ResourceId::parse(&raw_id) {
        Ok(id) => id,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let (token, issued) = match read_token(request.headers()) {
        Ok(token) => (token, false),
        Err(_) => (Token::issue(), true),
    };
    let user_id = user_id(request.headers());

    let now = state.clock.now_ms();
    let result = state
        .admission
        .allocator
        .acquire(&resource_id, &token, user_id.as_ref(), now)
        .await;

    let mut response = match result {
        Ok(AcquireResult::Granted { lease }) => {
            request.extensions_mut().insert(Admitted { lease });
            next.run(request).await
        }
        Ok(AcquireResult::Denied {
            active, capacity, ..
        }) => {
            debug!(resource = %resource_id, active, capacity, "sent to wait page");
            Redirect::to(&format!("/wait?resourceId={resource_id}")).into_response()
        }
        Err(e) => return ApiError::from(e).into_response(),
    };

    if issued {
        if let Ok(cookie) = HeaderValue::from_str(&token_cookie(&token, state.cookie_secure)) {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
    }
    response
}

fn user_id(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| UserId::parse(raw).ok())
}
