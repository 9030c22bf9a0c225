//! Synchronous sub-request endpoints for the reverse proxy.
//!
//! The proxy gates sibling surfaces (dashboard, log UI, the terminal port)
//! with an auth sub-request per incoming request:
//!
//! - `GET /session/validate` — is the `demo_session` cookie a live session or
//!   pending token? 200 names a `demo-<8>` principal in `X-Grafana-User`.
//! - `GET /invite/validate` — is this invite token acceptable right now?
//!   Read-only: a just-expired record is not written back on this path.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::coordinator::TokenCheck;
use crate::invites::{self, RejectReason, Verdict};
use crate::ws::source_address;
use crate::AppState;

/// Cookie carrying the session bearer token.
const SESSION_COOKIE: &str = "demo_session";

/// Proxy header naming the authenticated principal.
const USER_HEADER: &str = "x-grafana-user";

/// `GET /session/validate`
pub async fn session_validate(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = session_cookie(&headers) else {
        return (StatusCode::UNAUTHORIZED, "No session cookie").into_response();
    };
    match state.coordinator.check_session_token(&token).await {
        TokenCheck::Session(session_id) => principal_response(&session_id),
        TokenCheck::Pending(client_id) => principal_response(&client_id),
        TokenCheck::Unknown => (StatusCode::UNAUTHORIZED, "Session not active").into_response(),
    }
}

fn principal_response(id: &str) -> Response {
    let principal = format!("demo-{}", &id[..8.min(id.len())]);
    ([(USER_HEADER, principal)], "OK").into_response()
}

/// Extract the `demo_session` value from the `Cookie` header.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get("cookie")?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Deserialize)]
pub struct InviteQuery {
    token: Option<String>,
}

/// `GET /invite/validate`
pub async fn invite_validate(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<InviteQuery>,
    headers: HeaderMap,
) -> Response {
    let token = headers
        .get("x-invite-token")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .or(query.token);
    let Some(token) = token else {
        return rejection(RejectReason::Invalid);
    };

    let source = source_address(&headers, peer);
    let rejoin = state.coordinator.invite_rejoin_match(&token, &source).await;
    match invites::validate(&state.store, &state.metrics, &token, rejoin, false).await {
        Verdict::Valid { .. } => Json(json!({"valid": true})).into_response(),
        Verdict::Rejected(reason) => rejection(reason),
    }
}

fn rejection(reason: RejectReason) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "valid": false,
            "reason": reason.as_str(),
            "message": reason.message(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", value.parse().unwrap());
        headers
    }

    #[test]
    fn finds_session_cookie_among_others() {
        let headers = headers_with_cookie("theme=dark; demo_session=abc.def; lang=en");
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc.def"));
    }

    #[test]
    fn missing_or_empty_cookie_yields_none() {
        assert!(session_cookie(&HeaderMap::new()).is_none());
        assert!(session_cookie(&headers_with_cookie("theme=dark")).is_none());
        assert!(session_cookie(&headers_with_cookie("demo_session=")).is_none());
    }

    #[test]
    fn principal_uses_first_eight_chars() {
        let response = principal_response("0123456789abcdef");
        assert_eq!(
            response.headers().get(USER_HEADER).unwrap(),
            "demo-01234567"
        );
    }
}
