//! Status fan-out for observers outside the state machine.
//!
//! Observers either poll [`StatusBroadcaster::snapshot`] or subscribe to the
//! event stream, which always opens with the current snapshot. This is
//! telemetry: a subscriber that falls behind skips ahead instead of blocking
//! publishers.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    audit::iso_timestamp_utc,
    campaign::DeliveryOutcome,
    domain::{CampaignId, ConnectionState},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub pairing_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: String,
}

impl ConnectionEvent {
    pub fn new(state: ConnectionState, pairing_code: Option<String>, reason: Option<String>) -> Self {
        Self {
            state,
            pairing_code,
            reason,
            timestamp: iso_timestamp_utc(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignPhase {
    Running,
    Completed,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CampaignProgress {
    pub id: CampaignId,
    pub total: usize,
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub phase: CampaignPhase,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub connection: ConnectionState,
    pub pairing_code: Option<String>,
    pub updated_at: String,
    /// The running campaign, or the last one to finish.
    pub campaign: Option<CampaignProgress>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Idle,
            pairing_code: None,
            updated_at: iso_timestamp_utc(),
            campaign: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Snapshot(StatusSnapshot),
    Connection(ConnectionEvent),
    CampaignStarted {
        campaign_id: CampaignId,
        total: usize,
    },
    Progress {
        campaign_id: CampaignId,
        total: usize,
        outcome: DeliveryOutcome,
    },
    CampaignFinished {
        campaign_id: CampaignId,
        sent: usize,
        failed: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        aborted: Option<String>,
    },
}

#[derive(Clone)]
pub struct StatusBroadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<StatusEvent>,
    snapshot: RwLock<StatusSnapshot>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                snapshot: RwLock::new(StatusSnapshot::default()),
            }),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.read().clone()
    }

    /// Current snapshot plus a receiver for everything published after it.
    pub fn subscribe(&self) -> (StatusSnapshot, broadcast::Receiver<StatusEvent>) {
        // Publishers hold the write lock while sending, so no event can fall
        // between the snapshot and the subscription.
        let guard = self.read();
        let rx = self.inner.tx.subscribe();
        (guard.clone(), rx)
    }

    /// Snapshot first, then live events. Lagged events are skipped.
    pub fn subscribe_stream(&self) -> impl Stream<Item = StatusEvent> + Send + 'static {
        let (snapshot, rx) = self.subscribe();
        stream::once(async move { StatusEvent::Snapshot(snapshot) }).chain(
            BroadcastStream::new(rx).filter_map(|item| async move { item.ok() }),
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    pub(crate) fn publish_connection(&self, event: ConnectionEvent) {
        self.update(|snap| {
            snap.connection = event.state;
            snap.pairing_code = event.pairing_code.clone();
            StatusEvent::Connection(event)
        });
    }

    pub(crate) fn campaign_started(&self, id: CampaignId, total: usize) {
        self.update(|snap| {
            snap.campaign = Some(CampaignProgress {
                id,
                total,
                processed: 0,
                sent: 0,
                failed: 0,
                phase: CampaignPhase::Running,
                started_at: iso_timestamp_utc(),
                finished_at: None,
                abort_reason: None,
            });
            StatusEvent::CampaignStarted {
                campaign_id: id,
                total,
            }
        });
    }

    pub(crate) fn campaign_progress(&self, id: CampaignId, outcome: &DeliveryOutcome) {
        self.update(|snap| {
            let mut total = 0;
            if let Some(p) = snap.campaign.as_mut().filter(|p| p.id == id) {
                p.processed += 1;
                if outcome.is_sent() {
                    p.sent += 1;
                } else {
                    p.failed += 1;
                }
                total = p.total;
            }
            StatusEvent::Progress {
                campaign_id: id,
                total,
                outcome: outcome.clone(),
            }
        });
    }

    pub(crate) fn campaign_finished(&self, id: CampaignId, aborted: Option<String>) {
        self.update(|snap| {
            let (mut sent, mut failed) = (0, 0);
            if let Some(p) = snap.campaign.as_mut().filter(|p| p.id == id) {
                p.phase = if aborted.is_some() {
                    CampaignPhase::Aborted
                } else {
                    CampaignPhase::Completed
                };
                p.finished_at = Some(iso_timestamp_utc());
                p.abort_reason = aborted.clone();
                sent = p.sent;
                failed = p.failed;
            }
            StatusEvent::CampaignFinished {
                campaign_id: id,
                sent,
                failed,
                aborted,
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut StatusSnapshot) -> StatusEvent) {
        let mut guard = self.write();
        let event = f(&mut guard);
        guard.updated_at = iso_timestamp_utc();
        // No subscribers is fine; the snapshot still serves pollers.
        let _ = self.inner.tx.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, StatusSnapshot> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StatusSnapshot> {
        self.inner
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
