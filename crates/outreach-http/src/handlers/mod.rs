//! Operator route handlers.
//!
//! Every handler is a thin adapter: it checks the request shape, calls into
//! `outreach-core` (session manager or dispatcher) and audits the action.
//! Delivery itself never happens on a request task.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use outreach_core::{
    access::{actor_label, bearer_token},
    audit::AuditEvent,
};

use crate::router::AppState;

pub mod campaign;
pub mod events;
pub mod session;
pub mod status;

/// Browsers cannot set headers on a WebSocket upgrade, so `/events` may pass
/// the token as `?access_token=`.
const TOKEN_QUERY_PARAM: &str = "access_token";

pub async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let token = request_token(req.headers(), Some(req.uri()));
    if state.gate.is_authorized(token.as_deref()) {
        return next.run(req).await;
    }

    let actor = actor_label(token.as_deref());
    let route = req.uri().path().to_string();
    warn!(actor = %actor, route = %route, "rejected unauthorized request");
    state.audit.record(AuditEvent::access_denied(&actor, &route));
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

/// Audit label for the caller behind these headers.
pub(crate) fn actor(headers: &HeaderMap) -> String {
    actor_label(request_token(headers, None).as_deref())
}

fn request_token(headers: &HeaderMap, uri: Option<&Uri>) -> Option<String> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Some(token) = bearer_token(header) {
        return Some(token.to_string());
    }
    let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(uri?).ok()?;
    params
        .remove(TOKEN_QUERY_PARAM)
        .filter(|v| !v.is_empty())
}
