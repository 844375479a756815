use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of the single transport session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    AwaitingPairing,
    Authenticated,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::AwaitingPairing => "awaiting_pairing",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Disconnected => "disconnected",
        }
    }

    /// A session that is pairing or paired.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingPairing | ConnectionState::Authenticated
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-addressable recipient (e.g. `15551234567@s.whatsapp.net`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Address(pub String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned to an accepted campaign.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub Uuid);

impl CampaignId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CampaignId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque authentication material produced by the transport.
///
/// The relay never interprets these bytes; it only stores, fingerprints and
/// hands them back to the transport on reconnect.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBundle(pub Vec<u8>);

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialBundle({} bytes)", self.0.len())
    }
}

/// Reference to persisted credential material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CredentialHandle {
    pub fingerprint: String,
    pub saved_at: String,
}
