use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use outreach_core::{
    domain::{CampaignId, ConnectionState},
    status::{CampaignPhase, CampaignProgress, StatusSnapshot},
};

use crate::router::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub state: ConnectionState,
    pub pairing_code: Option<String>,
    pub updated_at: String,
    pub campaign: Option<CampaignView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignView {
    pub id: CampaignId,
    pub total: usize,
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub phase: CampaignPhase,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub abort_reason: Option<String>,
}

impl From<CampaignProgress> for CampaignView {
    fn from(p: CampaignProgress) -> Self {
        Self {
            id: p.id,
            total: p.total,
            processed: p.processed,
            sent: p.sent,
            failed: p.failed,
            phase: p.phase,
            started_at: p.started_at,
            finished_at: p.finished_at,
            abort_reason: p.abort_reason,
        }
    }
}

impl From<StatusSnapshot> for StatusResponse {
    fn from(s: StatusSnapshot) -> Self {
        Self {
            state: s.connection,
            pairing_code: s.pairing_code,
            updated_at: s.updated_at,
            campaign: s.campaign.map(CampaignView::from),
        }
    }
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(state.session.status().snapshot().into())
}
