use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Pacing applied by the campaign dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingConfig {
    /// Fixed pause after every attachment send.
    pub attachment_pause: Duration,
    /// Lower bound of the randomized pause between recipients.
    pub recipient_delay_min: Duration,
    /// Upper bound (inclusive) of the randomized pause between recipients.
    pub recipient_delay_max: Duration,
    /// How long a send waits for a reconnecting session before giving up.
    pub reconnect_grace: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            attachment_pause: Duration::from_millis(2_000),
            recipient_delay_min: Duration::from_millis(5_000),
            recipient_delay_max: Duration::from_millis(7_000),
            reconnect_grace: Duration::from_millis(30_000),
        }
    }
}

impl PacingConfig {
    /// No pauses at all. Useful for tests and dry runs.
    pub fn no_delay() -> Self {
        Self {
            attachment_pause: Duration::ZERO,
            recipient_delay_min: Duration::ZERO,
            recipient_delay_max: Duration::ZERO,
            reconnect_grace: Duration::ZERO,
        }
    }
}

/// Capped exponential backoff for automatic reconnects.
///
/// Attempts are unlimited; only the spacing grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Typed configuration for the relay, loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // HTTP surface
    pub bind_addr: String,
    pub port: u16,
    pub api_tokens: Vec<String>,
    pub max_body_bytes: usize,

    // Session
    pub session_dir: PathBuf,
    pub auto_resume: bool,
    pub address_domain: String,
    pub client_name: String,

    // Dispatch + reconnect timing
    pub pacing: PacingConfig,
    pub reconnect: ReconnectPolicy,

    // Bridge sidecar
    pub bridge_program: PathBuf,
    pub bridge_args: Vec<String>,
    pub bridge_timeout: Duration,

    // Status fan-out
    pub event_buffer: usize,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,
}

impl Config {
    /// Load from the process environment, after merging `.env` (if present)
    /// without overriding variables that are already set.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let str_of = |key: &str| get(key).and_then(non_empty);
        let u64_of = |key: &str| -> Result<Option<u64>> {
            str_of(key)
                .map(|s| {
                    s.trim()
                        .parse::<u64>()
                        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer")))
                })
                .transpose()
        };
        let bool_of = |key: &str| str_of(key).map(|s| parse_bool(&s));
        let millis = |key: &str, default: u64| -> Result<Duration> {
            Ok(Duration::from_millis(u64_of(key)?.unwrap_or(default)))
        };

        // HTTP surface
        let bind_addr = str_of("OUTREACH_BIND").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match str_of("PORT") {
            Some(p) => p
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("PORT is not a valid port: {p}")))?,
            None => 10_000,
        };
        let api_tokens = parse_csv(str_of("OUTREACH_API_TOKENS"));
        let max_body_bytes = u64_of("OUTREACH_MAX_BODY_BYTES")?.unwrap_or(200 * 1024 * 1024) as usize;

        // Session
        let session_dir = PathBuf::from(
            str_of("OUTREACH_SESSION_DIR").unwrap_or_else(|| "./session_auth".to_string()),
        );
        let auto_resume = bool_of("OUTREACH_AUTO_RESUME").unwrap_or(true);
        let address_domain =
            str_of("OUTREACH_ADDRESS_DOMAIN").unwrap_or_else(|| "s.whatsapp.net".to_string());
        let client_name = str_of("OUTREACH_CLIENT_NAME").unwrap_or_else(|| "Outreach".to_string());

        // Pacing
        let pacing = PacingConfig {
            attachment_pause: millis("OUTREACH_ATTACHMENT_PAUSE_MS", 2_000)?,
            recipient_delay_min: millis("OUTREACH_RECIPIENT_DELAY_MIN_MS", 5_000)?,
            recipient_delay_max: millis("OUTREACH_RECIPIENT_DELAY_MAX_MS", 7_000)?,
            reconnect_grace: millis("OUTREACH_RECONNECT_GRACE_MS", 30_000)?,
        };
        if pacing.recipient_delay_min > pacing.recipient_delay_max {
            return Err(Error::Config(
                "OUTREACH_RECIPIENT_DELAY_MIN_MS must not exceed OUTREACH_RECIPIENT_DELAY_MAX_MS"
                    .to_string(),
            ));
        }

        let reconnect = ReconnectPolicy {
            base_delay: millis("OUTREACH_RECONNECT_BASE_MS", 1_000)?,
            max_delay: millis("OUTREACH_RECONNECT_MAX_MS", 60_000)?,
        };
        if reconnect.base_delay > reconnect.max_delay {
            return Err(Error::Config(
                "OUTREACH_RECONNECT_BASE_MS must not exceed OUTREACH_RECONNECT_MAX_MS".to_string(),
            ));
        }

        // Bridge sidecar
        let Some(bridge_program) = str_of("OUTREACH_BRIDGE_CMD").map(PathBuf::from) else {
            return Err(Error::Config(
                "OUTREACH_BRIDGE_CMD environment variable is required".to_string(),
            ));
        };
        let bridge_args = str_of("OUTREACH_BRIDGE_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let bridge_timeout = millis("OUTREACH_BRIDGE_TIMEOUT_MS", 60_000)?;

        let event_buffer = (u64_of("OUTREACH_EVENT_BUFFER")?.unwrap_or(256) as usize).max(1);

        // Audit logging
        let audit_log_path = PathBuf::from(
            str_of("AUDIT_LOG_PATH").unwrap_or_else(|| "/tmp/outreach-audit.log".to_string()),
        );
        let audit_log_json = bool_of("AUDIT_LOG_JSON").unwrap_or(false);

        Ok(Self {
            bind_addr,
            port,
            api_tokens,
            max_body_bytes,
            session_dir,
            auto_resume,
            address_domain,
            client_name,
            pacing,
            reconnect,
            bridge_program,
            bridge_args,
            bridge_timeout,
            event_buffer,
            audit_log_path,
            audit_log_json,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
