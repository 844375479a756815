//! Campaign dispatcher: one paced, best-effort broadcast at a time.
//!
//! A campaign walks its recipients in submitted order, records one outcome
//! per recipient and never stops early for a per-recipient failure. Only
//! session loss or an operator cancel ends it before the last recipient.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::{
    sync::{mpsc, watch, Mutex, OwnedMutexGuard},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    campaign::{resolve_address, Attachment, CampaignRequest, DeliveryOutcome},
    config::PacingConfig,
    connection::SessionManager,
    domain::{Address, CampaignId, ConnectionState},
    errors::Error,
    status::StatusBroadcaster,
    transport::{MediaPayload, Transport},
};

const REASON_MALFORMED: &str = "malformed address";

/// Why a submission was refused. Nothing was sent when this is returned.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchRejected {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session is not authenticated")]
    NotAuthenticated,

    #[error("a campaign is already running")]
    CampaignRunning,
}

/// Accepted campaign. `outcomes` yields one entry per recipient, in order,
/// and closes when the campaign ends.
#[derive(Debug)]
pub struct CampaignHandle {
    pub id: CampaignId,
    pub outcomes: mpsc::UnboundedReceiver<DeliveryOutcome>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    SessionLost,
}

impl Interrupt {
    fn reason(self) -> &'static str {
        match self {
            Interrupt::Cancelled => "campaign cancelled",
            Interrupt::SessionLost => "session disconnected",
        }
    }
}

enum DeliveryError {
    Send(Error),
    Interrupted(Interrupt),
}

#[derive(Clone)]
pub struct CampaignDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    transport: Arc<dyn Transport>,
    session: watch::Receiver<ConnectionState>,
    status: StatusBroadcaster,
    pacing: PacingConfig,
    address_domain: String,
    running: Arc<Mutex<()>>,
    current: std::sync::Mutex<Option<(CampaignId, CancellationToken)>>,
}

impl CampaignDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: &SessionManager,
        pacing: PacingConfig,
        address_domain: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                transport,
                session: session.watch_state(),
                status: session.status().clone(),
                pacing,
                address_domain: address_domain.into(),
                running: Arc::new(Mutex::new(())),
                current: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Validate and start a campaign on its own task.
    ///
    /// Checks run in order: request shape, session state, then the
    /// single-campaign lock.
    pub fn dispatch(&self, request: CampaignRequest) -> Result<CampaignHandle, DispatchRejected> {
        if let Err(e) = request.validate() {
            let msg = match e {
                Error::InvalidRequest(msg) => msg,
                other => other.to_string(),
            };
            return Err(DispatchRejected::InvalidRequest(msg));
        }
        if *self.inner.session.borrow() != ConnectionState::Authenticated {
            return Err(DispatchRejected::NotAuthenticated);
        }
        let guard = self
            .inner
            .running
            .clone()
            .try_lock_owned()
            .map_err(|_| DispatchRejected::CampaignRunning)?;

        let id = CampaignId::new();
        let cancel = CancellationToken::new();
        self.inner.set_current(Some((id, cancel.clone())));

        let total = request.recipients.len();
        info!(
            campaign = %id,
            recipients = total,
            attachments = request.attachments.len(),
            "campaign accepted"
        );
        self.inner.status.campaign_started(id, total);

        let (tx, outcomes) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run(id, request, tx, cancel, guard).await;
        });

        Ok(CampaignHandle { id, outcomes })
    }

    /// Cancel the running campaign, if any. Returns its id.
    pub fn cancel(&self) -> Option<CampaignId> {
        let current = self.inner.current();
        if let Some((id, token)) = &current {
            info!(campaign = %id, "campaign cancel requested");
            token.cancel();
        }
        current.map(|(id, _)| id)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.try_lock().is_err()
    }

    pub fn current_campaign(&self) -> Option<CampaignId> {
        self.inner.current().map(|(id, _)| id)
    }
}

impl DispatcherInner {
    async fn run(
        &self,
        id: CampaignId,
        request: CampaignRequest,
        tx: mpsc::UnboundedSender<DeliveryOutcome>,
        cancel: CancellationToken,
        guard: OwnedMutexGuard<()>,
    ) {
        let mut session = self.session.clone();
        let aborted = self
            .deliver_all(id, &request, &tx, &cancel, &mut session)
            .await;
        drop(tx);

        self.set_current(None);
        drop(guard);

        match &aborted {
            Some(reason) => warn!(campaign = %id, reason = %reason, "campaign aborted"),
            None => info!(campaign = %id, "campaign completed"),
        }
        self.status.campaign_finished(id, aborted.map(str::to_string));
    }

    /// Returns the abort reason when the campaign stopped early.
    async fn deliver_all(
        &self,
        id: CampaignId,
        request: &CampaignRequest,
        tx: &mpsc::UnboundedSender<DeliveryOutcome>,
        cancel: &CancellationToken,
        session: &mut watch::Receiver<ConnectionState>,
    ) -> Option<&'static str> {
        for (index, raw) in request.recipients.iter().enumerate() {
            if index > 0 {
                let pause = recipient_pause(&self.pacing);
                if let Err(stop) = self.pause(pause, cancel, session).await {
                    return Some(self.fail_remaining(id, request, index, stop, tx));
                }
            }
            if cancel.is_cancelled() {
                return Some(self.fail_remaining(id, request, index, Interrupt::Cancelled, tx));
            }
            if is_gone(*session.borrow()) {
                return Some(self.fail_remaining(id, request, index, Interrupt::SessionLost, tx));
            }

            let address = match resolve_address(raw, &self.address_domain) {
                Ok(address) => address,
                Err(_) => {
                    warn!(campaign = %id, index, "skipping malformed address");
                    self.report(id, DeliveryOutcome::failed(index, raw, REASON_MALFORMED), tx);
                    continue;
                }
            };

            match self.deliver(&address, request, cancel, session).await {
                Ok(()) => {
                    debug!(campaign = %id, index, to = %address, "delivered");
                    self.report(id, DeliveryOutcome::sent(index, raw), tx);
                }
                Err(DeliveryError::Send(e)) => {
                    warn!(campaign = %id, index, to = %address, error = %e, "delivery failed");
                    self.report(id, DeliveryOutcome::failed(index, raw, e.to_string()), tx);
                }
                Err(DeliveryError::Interrupted(stop)) => {
                    return Some(self.fail_remaining(id, request, index, stop, tx));
                }
            }

            // The pause after the last attachment belongs to this recipient but
            // runs once its outcome is recorded.
            if !request.attachments.is_empty() {
                if let Err(stop) = self.pause(self.pacing.attachment_pause, cancel, session).await {
                    if index + 1 == request.recipients.len() {
                        debug!(campaign = %id, "interrupted after the last recipient; nothing left to fail");
                        break;
                    }
                    return Some(self.fail_remaining(id, request, index + 1, stop, tx));
                }
            }
        }
        None
    }

    async fn deliver(
        &self,
        to: &Address,
        request: &CampaignRequest,
        cancel: &CancellationToken,
        session: &mut watch::Receiver<ConnectionState>,
    ) -> Result<(), DeliveryError> {
        if request.attachments.is_empty() {
            let Some(body) = request.body.as_deref() else {
                return Err(DeliveryError::Send(Error::InvalidRequest(
                    "nothing to send".to_string(),
                )));
            };
            self.await_session(cancel, session)
                .await
                .map_err(DeliveryError::Interrupted)?;
            return self
                .transport
                .send_text(to, body)
                .await
                .map_err(DeliveryError::Send);
        }

        let last = request.attachments.len() - 1;
        for (i, attachment) in request.attachments.iter().enumerate() {
            self.await_session(cancel, session)
                .await
                .map_err(DeliveryError::Interrupted)?;
            let caption = if i == 0 { request.body.as_deref() } else { None };
            self.transport
                .send_media(to, media_payload(attachment, caption))
                .await
                .map_err(DeliveryError::Send)?;

            if i < last {
                self.pause(self.pacing.attachment_pause, cancel, session)
                    .await
                    .map_err(DeliveryError::Interrupted)?;
            }
        }
        Ok(())
    }

    /// Wait until the session can carry a send.
    ///
    /// A reconnecting session gets `reconnect_grace` to come back; an
    /// Idle/Disconnected one fails immediately.
    async fn await_session(
        &self,
        cancel: &CancellationToken,
        session: &mut watch::Receiver<ConnectionState>,
    ) -> Result<(), Interrupt> {
        let state = *session.borrow_and_update();
        match state {
            ConnectionState::Authenticated => return Ok(()),
            ConnectionState::AwaitingPairing => {}
            ConnectionState::Idle | ConnectionState::Disconnected => {
                return Err(Interrupt::SessionLost)
            }
        }

        debug!(grace_ms = self.pacing.reconnect_grace.as_millis() as u64, "waiting for session to come back");
        let settled = async {
            session
                .wait_for(|s| *s != ConnectionState::AwaitingPairing)
                .await
                .map(|s| *s)
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            res = tokio::time::timeout(self.pacing.reconnect_grace, settled) => match res {
                Ok(Ok(ConnectionState::Authenticated)) => Ok(()),
                _ => Err(Interrupt::SessionLost),
            },
        }
    }

    /// Sleep, waking early on cancel or on a session that is gone for good.
    async fn pause(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
        session: &mut watch::Receiver<ConnectionState>,
    ) -> Result<(), Interrupt> {
        let gone = async {
            let _ = session.wait_for(|s| is_gone(*s)).await;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = gone => Err(Interrupt::SessionLost),
            _ = sleep(duration) => Ok(()),
        }
    }

    fn fail_remaining(
        &self,
        id: CampaignId,
        request: &CampaignRequest,
        from: usize,
        stop: Interrupt,
        tx: &mpsc::UnboundedSender<DeliveryOutcome>,
    ) -> &'static str {
        let reason = stop.reason();
        for (index, raw) in request.recipients.iter().enumerate().skip(from) {
            self.report(id, DeliveryOutcome::failed(index, raw, reason), tx);
        }
        reason
    }

    fn report(
        &self,
        id: CampaignId,
        outcome: DeliveryOutcome,
        tx: &mpsc::UnboundedSender<DeliveryOutcome>,
    ) {
        self.status.campaign_progress(id, &outcome);
        // The submitter may have stopped listening; status still has it.
        let _ = tx.send(outcome);
    }

    fn current(&self) -> Option<(CampaignId, CancellationToken)> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_current(&self, value: Option<(CampaignId, CancellationToken)>) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
    }
}

fn is_gone(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Idle | ConnectionState::Disconnected)
}

/// Uniform draw from `[min, max]`; a degenerate range yields `min`.
fn recipient_pause(pacing: &PacingConfig) -> Duration {
    let min = pacing.recipient_delay_min.as_millis() as u64;
    let max = pacing.recipient_delay_max.as_millis() as u64;
    if max <= min {
        return pacing.recipient_delay_min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

fn media_payload<'a>(attachment: &'a Attachment, caption: Option<&'a str>) -> MediaPayload<'a> {
    MediaPayload {
        bytes: &attachment.bytes,
        mime_class: attachment.mime_class,
        mimetype: &attachment.mimetype,
        filename: &attachment.filename,
        caption,
    }
}
