//! In-process transport double shared by the state machine and dispatcher tests.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;

use crate::{
    campaign::MimeClass,
    domain::{Address, CredentialBundle},
    errors::Error,
    transport::{MediaPayload, Transport, TransportEvent, TransportEvents},
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SendCall {
    Text {
        to: String,
        text: String,
    },
    Media {
        to: String,
        class: MimeClass,
        filename: String,
        caption: Option<String>,
    },
}

impl SendCall {
    pub(crate) fn to(&self) -> &str {
        match self {
            SendCall::Text { to, .. } | SendCall::Media { to, .. } => to,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    connects: Mutex<Vec<Option<CredentialBundle>>>,
    events: Mutex<Option<TransportEvents>>,
    sends: Mutex<Vec<SendCall>>,
    logouts: AtomicUsize,
    fail_connect: AtomicBool,
    fail_logout: AtomicBool,
    failing: Mutex<HashSet<String>>,
    /// Emitted right after the send with this index completes.
    drop_after_send: Mutex<Option<(usize, TransportEvent)>>,
}

impl FakeTransport {
    pub(crate) fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.emit(event);
        }
    }

    pub(crate) fn connect_calls(&self) -> Vec<Option<CredentialBundle>> {
        self.connects.lock().unwrap().clone()
    }

    pub(crate) fn sends(&self) -> Vec<SendCall> {
        self.sends.lock().unwrap().clone()
    }

    pub(crate) fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_logout(&self, fail: bool) {
        self.fail_logout.store(fail, Ordering::SeqCst);
    }

    /// Every send to this resolved address fails.
    pub(crate) fn fail_sends_to(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub(crate) fn emit_after_send(&self, index: usize, event: TransportEvent) {
        *self.drop_after_send.lock().unwrap() = Some((index, event));
    }

    fn record(&self, call: SendCall) -> Result<()> {
        let fail = self.failing.lock().unwrap().contains(call.to());
        let index = {
            let mut sends = self.sends.lock().unwrap();
            sends.push(call);
            sends.len() - 1
        };

        let trigger = {
            let mut slot = self.drop_after_send.lock().unwrap();
            match slot.as_ref() {
                Some((at, _)) if *at == index => slot.take().map(|(_, ev)| ev),
                _ => None,
            }
        };
        if let Some(event) = trigger {
            self.emit(event);
        }

        if fail {
            return Err(Error::Transport("recipient not on network".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        credentials: Option<CredentialBundle>,
        events: TransportEvents,
    ) -> Result<()> {
        self.connects.lock().unwrap().push(credentials);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Transport("sidecar failed to start".to_string()));
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn send_text(&self, to: &Address, text: &str) -> Result<()> {
        self.record(SendCall::Text {
            to: to.to_string(),
            text: text.to_string(),
        })
    }

    async fn send_media(&self, to: &Address, media: MediaPayload<'_>) -> Result<()> {
        self.record(SendCall::Media {
            to: to.to_string(),
            class: media.mime_class,
            filename: media.filename.to_string(),
            caption: media.caption.map(str::to_string),
        })
    }

    async fn logout(&self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(Error::Transport("logout request timed out".to_string()));
        }
        Ok(())
    }
}
