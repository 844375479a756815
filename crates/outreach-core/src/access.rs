use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::store::fingerprint;

// ============== Access Gate ==============

/// Bearer-token allowlist in front of the operator surface.
///
/// An empty allowlist leaves the surface open.
#[derive(Clone, Debug, Default)]
pub struct AccessGate {
    tokens: Vec<String>,
}

impl AccessGate {
    pub fn new(tokens: Vec<String>) -> Self {
        let tokens = tokens
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Self { tokens }
    }

    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn is_authorized(&self, token: Option<&str>) -> bool {
        if self.is_open() {
            return true;
        }
        let Some(token) = token else {
            return false;
        };
        self.tokens
            .iter()
            .any(|allowed| constant_time_eq(allowed.as_bytes(), token.as_bytes()))
    }
}

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Audit-safe caller label; never contains the token itself.
pub fn actor_label(token: Option<&str>) -> String {
    match token {
        Some(t) => format!("token:{}", fingerprint(t.as_bytes(), 12)),
        None => "anonymous".to_string(),
    }
}

/// Compares digests so the length of the allowed token does not show in timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let (a, b) = (Sha256::digest(a), Sha256::digest(b));
    a.as_slice().ct_eq(b.as_slice()).into()
}
