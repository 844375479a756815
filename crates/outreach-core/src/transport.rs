use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    campaign::MimeClass,
    domain::{Address, CredentialBundle},
    Result,
};

/// Why the transport session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The account was logged out (remotely or by us). Credentials are dead.
    LoggedOut,
    /// Anything else: network blips, server restarts, a crashed sidecar.
    Transient(String),
}

impl DropReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, DropReason::LoggedOut)
    }

    pub fn describe(&self) -> String {
        match self {
            DropReason::LoggedOut => "logged out".to_string(),
            DropReason::Transient(why) => why.clone(),
        }
    }
}

/// Unsolicited notifications from the transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// A fresh (possibly rotated) pairing code to show the operator.
    PairingCode(String),
    /// The transport produced new credential material to persist.
    CredentialsUpdated(CredentialBundle),
    /// The session is open and authenticated.
    Authenticated,
    /// The session closed.
    Dropped(DropReason),
}

/// Event sink handed to a transport on `connect`.
///
/// Each connect gets a new generation; the state machine ignores events from
/// a generation it has already superseded.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// One media send.
#[derive(Clone, Copy, Debug)]
pub struct MediaPayload<'a> {
    pub bytes: &'a [u8],
    pub mime_class: MimeClass,
    pub mimetype: &'a str,
    pub filename: &'a str,
    pub caption: Option<&'a str>,
}

/// Boundary to the chat network's session library.
///
/// Implementations own the wire protocol; the relay only relies on this contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a session, resuming `credentials` when present. Pairing codes,
    /// authentication, credential updates and drops arrive on `events`.
    async fn connect(
        &self,
        credentials: Option<CredentialBundle>,
        events: TransportEvents,
    ) -> Result<()>;

    async fn send_text(&self, to: &Address, text: &str) -> Result<()>;

    async fn send_media(&self, to: &Address, media: MediaPayload<'_>) -> Result<()>;

    async fn logout(&self) -> Result<()>;
}
