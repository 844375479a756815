//! Connection state machine for the single transport session.
//!
//! Idle → AwaitingPairing → Authenticated, with Disconnected reachable from
//! anywhere. Operator calls (`pair`, `disconnect`) and transport callbacks
//! are serialized behind one mutex; transport callbacks arrive on a typed
//! channel drained by a single pump task, never by mutating state directly.

use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ReconnectPolicy,
    domain::{ConnectionState, CredentialBundle, CredentialHandle},
    status::{ConnectionEvent, StatusBroadcaster},
    store::SessionStore,
    transport::{Transport, TransportEvent, TransportEvents},
    Result,
};

/// Result of a `pair()` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairOutcome {
    /// A transport session is starting.
    Started,
    /// A session is already pairing or paired; nothing changed.
    AlreadyActive(ConnectionState),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub pairing_code: Option<String>,
    pub credential_handle: Option<CredentialHandle>,
    pub reconnect_attempts: u32,
}

#[derive(Default)]
struct SessionState {
    state: ConnectionState,
    pairing_code: Option<String>,
    credential_handle: Option<CredentialHandle>,
    /// Credentials seen before authentication completed.
    pending_credentials: Option<CredentialBundle>,
    /// Bumped on every connect/teardown; events from older generations are stale.
    generation: u64,
    reconnect_attempts: u32,
    reconnect_task: Option<JoinHandle<()>>,
}

/// Owner of the process-wide session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    status: StatusBroadcaster,
    policy: ReconnectPolicy,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl SessionManager {
    /// Build the manager and start its transport event pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        status: StatusBroadcaster,
        policy: ReconnectPolicy,
    ) -> Self {
        let credential_handle = store.handle().unwrap_or_else(|e| {
            warn!(error = %e, "could not read stored credentials");
            None
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        let inner = Arc::new(ManagerInner {
            transport,
            store,
            status,
            policy,
            state: Mutex::new(SessionState {
                credential_handle,
                ..SessionState::default()
            }),
            state_tx,
            events_tx,
        });
        tokio::spawn(pump_events(Arc::downgrade(&inner), events_rx));

        Self { inner }
    }

    /// Current state without taking the state-machine lock.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that tracks every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn status(&self) -> &StatusBroadcaster {
        &self.inner.status
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let st = self.inner.state.lock().await;
        SessionSnapshot {
            state: st.state,
            pairing_code: st.pairing_code.clone(),
            credential_handle: st.credential_handle.clone(),
            reconnect_attempts: st.reconnect_attempts,
        }
    }

    /// Begin pairing (or resume with stored credentials).
    ///
    /// Only Idle and Disconnected can start a session; otherwise this is a
    /// no-op reporting the active state. A transport that fails to start
    /// leaves the session Disconnected and the error is returned.
    pub async fn pair(&self) -> Result<PairOutcome> {
        let mut st = self.inner.state.lock().await;
        if st.state.is_active() {
            debug!(state = %st.state, "pair requested while session active");
            return Ok(PairOutcome::AlreadyActive(st.state));
        }

        info!(from = %st.state, "starting pairing");
        if let Err(e) = self.inner.start_transport(&mut st, None).await {
            warn!(error = %e, "transport failed to start");
            st.generation += 1;
            self.inner.transition(
                &mut st,
                ConnectionState::Disconnected,
                Some(format!("pairing failed: {e}")),
            );
            return Err(e);
        }
        Ok(PairOutcome::Started)
    }

    /// Operator logout: always ends Disconnected with credentials wiped.
    ///
    /// A failing transport logout is logged and ignored; only a failure to
    /// remove the stored credentials is returned.
    pub async fn disconnect(&self) -> Result<()> {
        let mut st = self.inner.state.lock().await;
        st.generation += 1;
        if let Some(task) = st.reconnect_task.take() {
            task.abort();
        }
        st.reconnect_attempts = 0;

        if st.state.is_active() {
            if let Err(e) = self.inner.transport.logout().await {
                warn!(error = %e, "transport logout failed; wiping local session anyway");
            }
        }

        let wiped = self.inner.wipe_credentials(&mut st);
        self.inner.transition(
            &mut st,
            ConnectionState::Disconnected,
            Some("operator disconnect".to_string()),
        );
        info!("session disconnected by operator");
        wiped
    }

    /// Reconnect at startup when credentials survived a restart.
    ///
    /// Returns whether a session start was attempted.
    pub async fn resume(&self) -> Result<bool> {
        let stored = {
            let st = self.inner.state.lock().await;
            st.credential_handle.clone()
        };
        let Some(handle) = stored else {
            info!("no stored session to resume");
            return Ok(false);
        };

        let short: String = handle.fingerprint.chars().take(12).collect();
        info!(fingerprint = %short, saved_at = %handle.saved_at, "resuming stored session");
        match self.pair().await? {
            PairOutcome::Started => Ok(true),
            PairOutcome::AlreadyActive(_) => Ok(false),
        }
    }
}

impl ManagerInner {
    /// Start a new transport generation in AwaitingPairing.
    async fn start_transport(&self, st: &mut SessionState, reason: Option<String>) -> Result<()> {
        st.generation += 1;
        st.pending_credentials = None;
        self.transition(st, ConnectionState::AwaitingPairing, reason);

        let credentials = match self.store.load() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "stored credentials unusable; discarding and pairing fresh");
                if let Err(e) = self.wipe_credentials(st) {
                    error!(error = %e, "failed to wipe unusable credentials");
                }
                None
            }
        };

        let events = TransportEvents::new(st.generation, self.events_tx.clone());
        self.transport.connect(credentials, events).await
    }

    async fn handle_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        let mut st = self.state.lock().await;
        if generation != st.generation {
            debug!(generation, current = st.generation, "ignoring stale transport event");
            return;
        }

        match event {
            TransportEvent::PairingCode(code) => {
                if st.state != ConnectionState::AwaitingPairing {
                    debug!(state = %st.state, "pairing code outside pairing; ignored");
                    return;
                }
                st.pairing_code = Some(code);
                self.publish(&st, None);
            }
            TransportEvent::CredentialsUpdated(bundle) => {
                if st.state == ConnectionState::Authenticated {
                    self.persist_credentials(&mut st, &bundle);
                } else {
                    st.pending_credentials = Some(bundle);
                }
            }
            TransportEvent::Authenticated => {
                if st.state != ConnectionState::AwaitingPairing {
                    debug!(state = %st.state, "authenticated event outside pairing; ignored");
                    return;
                }
                if let Some(bundle) = st.pending_credentials.take() {
                    self.persist_credentials(&mut st, &bundle);
                }
                st.reconnect_attempts = 0;
                self.transition(&mut st, ConnectionState::Authenticated, None);
                info!("session authenticated");
            }
            TransportEvent::Dropped(reason) => {
                if !st.state.is_active() {
                    return;
                }
                // The dropped connection emits nothing further that matters.
                st.generation += 1;
                st.pending_credentials = None;

                if reason.is_logged_out() {
                    warn!("session logged out remotely; wiping credentials");
                    if let Err(e) = self.wipe_credentials(&mut st) {
                        error!(error = %e, "failed to wipe credentials after remote logout");
                    }
                    self.transition(
                        &mut st,
                        ConnectionState::Disconnected,
                        Some(reason.describe()),
                    );
                } else {
                    warn!(reason = %reason.describe(), "transport dropped; will reconnect");
                    self.transition(
                        &mut st,
                        ConnectionState::AwaitingPairing,
                        Some(reason.describe()),
                    );
                    self.schedule_reconnect(&mut st);
                }
            }
        }
    }

    /// Queue one automatic reconnect after the backoff for the current attempt.
    ///
    /// Attempts are unlimited; only the delay is capped.
    fn schedule_reconnect(self: &Arc<Self>, st: &mut SessionState) {
        let delay = self.policy.delay_for(st.reconnect_attempts);
        st.reconnect_attempts = st.reconnect_attempts.saturating_add(1);
        let expected = st.generation;
        if let Some(task) = st.reconnect_task.take() {
            task.abort();
        }

        debug!(attempt = st.reconnect_attempts, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        let weak = Arc::downgrade(self);
        st.reconnect_task = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(expected).await;
            }
        }));
    }

    async fn reconnect(self: &Arc<Self>, expected: u64) {
        let mut st = self.state.lock().await;
        if st.generation != expected || st.state != ConnectionState::AwaitingPairing {
            debug!("reconnect superseded");
            return;
        }
        // This is the running task; dropping the handle does not abort it.
        st.reconnect_task = None;

        info!(attempt = st.reconnect_attempts, "reconnecting with stored credentials");
        if let Err(e) = self
            .start_transport(&mut st, Some("reconnecting".to_string()))
            .await
        {
            warn!(error = %e, "reconnect attempt failed");
            st.generation += 1;
            self.publish(&st, Some(format!("reconnect failed: {e}")));
            self.schedule_reconnect(&mut st);
        }
    }

    fn persist_credentials(&self, st: &mut SessionState, bundle: &CredentialBundle) {
        match self.store.save(bundle) {
            Ok(handle) => st.credential_handle = Some(handle),
            Err(e) => error!(error = %e, "failed to persist credentials"),
        }
    }

    fn wipe_credentials(&self, st: &mut SessionState) -> Result<()> {
        st.pending_credentials = None;
        st.credential_handle = None;
        self.store.wipe()
    }

    fn transition(&self, st: &mut SessionState, next: ConnectionState, reason: Option<String>) {
        // A code belongs to one transport generation; every transition starts
        // a new one or leaves pairing.
        st.pairing_code = None;
        debug!(from = %st.state, to = %next, "connection transition");
        st.state = next;
        self.state_tx.send_replace(next);
        self.publish(st, reason);
    }

    fn publish(&self, st: &SessionState, reason: Option<String>) {
        self.status.publish_connection(ConnectionEvent::new(
            st.state,
            st.pairing_code.clone(),
            reason,
        ));
    }
}

async fn pump_events(
    inner: Weak<ManagerInner>,
    mut rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
) {
    while let Some((generation, event)) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(generation, event).await;
    }
}
