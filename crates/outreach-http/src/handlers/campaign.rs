use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use outreach_core::{
    audit::AuditEvent,
    campaign::{Attachment, CampaignRequest},
    dispatcher::DispatchRejected,
    domain::CampaignId,
    errors::Error,
};

use crate::{handlers::actor, router::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub recipients: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub media_list: Vec<MediaItem>,
}

#[derive(Debug, Deserialize)]
pub struct MediaItem {
    /// Base64, optionally as a data URL.
    pub data: String,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub accepted: bool,
    pub campaign_id: CampaignId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
}

pub async fn send(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Response {
    let actor = actor(&headers);
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let reason = rejection.body_text();
            state
                .audit
                .record(AuditEvent::campaign_rejected(&actor, 0, &reason));
            return rejected(StatusCode::BAD_REQUEST, &reason);
        }
    };

    let recipients = req.recipients.len();
    let request = match to_campaign_request(req) {
        Ok(r) => r,
        Err(e) => {
            let reason = match e {
                Error::InvalidRequest(msg) => msg,
                other => other.to_string(),
            };
            state
                .audit
                .record(AuditEvent::campaign_rejected(&actor, recipients, &reason));
            return rejected(StatusCode::BAD_REQUEST, &reason);
        }
    };

    let attachments = request.attachments.len();
    let body = request.body.clone();
    match state.dispatcher.dispatch(request) {
        Ok(handle) => {
            state.audit.record(AuditEvent::campaign_submitted(
                &actor,
                handle.id,
                recipients,
                attachments,
                body.as_deref(),
            ));
            info!(campaign = %handle.id, actor = %actor, "campaign submitted");
            // Progress is observed through the status broadcaster.
            (
                StatusCode::OK,
                Json(SendResponse {
                    accepted: true,
                    campaign_id: handle.id,
                }),
            )
                .into_response()
        }
        Err(rejection) => {
            let code = match rejection {
                DispatchRejected::CampaignRunning => StatusCode::CONFLICT,
                DispatchRejected::InvalidRequest(_) | DispatchRejected::NotAuthenticated => {
                    StatusCode::BAD_REQUEST
                }
            };
            let reason = rejection.to_string();
            warn!(actor = %actor, reason = %reason, "campaign rejected");
            state
                .audit
                .record(AuditEvent::campaign_rejected(&actor, recipients, &reason));
            rejected(code, &reason)
        }
    }
}

pub async fn cancel(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<CancelResponse> {
    let actor = actor(&headers);
    let campaign_id = state.dispatcher.cancel();
    state
        .audit
        .record(AuditEvent::campaign_cancelled(&actor, campaign_id));
    Json(CancelResponse {
        accepted: campaign_id.is_some(),
        campaign_id,
    })
}

fn to_campaign_request(req: SendRequest) -> outreach_core::Result<CampaignRequest> {
    let attachments = req
        .media_list
        .iter()
        .enumerate()
        .map(|(i, m)| {
            Attachment::from_base64(&m.data, m.mimetype.as_deref(), m.filename.as_deref(), i)
        })
        .collect::<outreach_core::Result<Vec<_>>>()?;
    CampaignRequest::new(req.recipients, req.message, attachments)
}

fn rejected(code: StatusCode, reason: &str) -> Response {
    (code, Json(json!({ "accepted": false, "error": reason }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::campaign::MimeClass;

    #[test]
    fn media_defaults_follow_upload_rules() {
        let req: SendRequest = serde_json::from_value(json!({
            "recipients": ["1"],
            "mediaList": [
                {"data": "aGk="},
                {"data": "data:image/png;base64,aGk=", "filename": "a.png"}
            ]
        }))
        .unwrap();
        let campaign = to_campaign_request(req).unwrap();
        assert!(campaign.body.is_none());

        let first = &campaign.attachments[0];
        assert_eq!(first.mimetype, "application/octet-stream");
        assert_eq!(first.filename, "document_0");
        assert_eq!(first.mime_class, MimeClass::Document);
        assert_eq!(first.bytes, b"hi".to_vec());

        let second = &campaign.attachments[1];
        assert_eq!(second.mimetype, "image/png");
        assert_eq!(second.mime_class, MimeClass::Image);
    }

    #[test]
    fn empty_request_is_invalid() {
        let req: SendRequest = serde_json::from_value(json!({"recipients": ["1"]})).unwrap();
        assert!(matches!(
            to_campaign_request(req),
            Err(Error::InvalidRequest(_))
        ));
    }
}
