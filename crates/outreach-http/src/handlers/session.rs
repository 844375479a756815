use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::{error, info};

use outreach_core::{
    audit::AuditEvent,
    connection::PairOutcome,
    domain::ConnectionState,
};

use crate::{handlers::actor, router::AppState};

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SessionResponse {
    fn new(accepted: bool, message: impl Into<String>) -> Self {
        Self {
            accepted,
            message: Some(message.into()),
        }
    }
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<SessionResponse>) {
    let actor = actor(&headers);
    let (code, body) = match state.session.pair().await {
        Ok(PairOutcome::Started) => (
            StatusCode::OK,
            SessionResponse::new(true, "pairing started; watch /status or /events for the code"),
        ),
        Ok(PairOutcome::AlreadyActive(ConnectionState::Authenticated)) => {
            (StatusCode::OK, SessionResponse::new(false, "already connected"))
        }
        Ok(PairOutcome::AlreadyActive(_)) => (
            StatusCode::OK,
            SessionResponse::new(false, "pairing already in progress"),
        ),
        Err(e) => {
            error!(error = %e, "pairing failed to start");
            (
                StatusCode::BAD_GATEWAY,
                SessionResponse::new(false, format!("pairing failed: {e}")),
            )
        }
    };
    state.audit.record(AuditEvent::connect(
        &actor,
        body.accepted,
        body.message.as_deref(),
    ));
    (code, Json(body))
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<SessionResponse>) {
    let actor = actor(&headers);
    state.audit.record(AuditEvent::disconnect(&actor));

    if let Some(id) = state.dispatcher.current_campaign() {
        info!(campaign = %id, "disconnect requested during a campaign; it will abort");
    }
    match state.session.disconnect().await {
        Ok(()) => (
            StatusCode::OK,
            Json(SessionResponse {
                accepted: true,
                message: None,
            }),
        ),
        Err(e) => {
            error!(error = %e, "failed to wipe stored credentials");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SessionResponse::new(
                    false,
                    format!("disconnected, but stored credentials could not be removed: {e}"),
                )),
            )
        }
    }
}
