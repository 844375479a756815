use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::Utc;
use serde::Serialize;

use crate::{domain::CampaignId, errors::Error, Result};

const AUDIT_MAX_TEXT: usize = 500;

/// RFC3339 timestamp in UTC (for logs/telemetry).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

/// One operator action. Delivery outcomes are deliberately not audited.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,
    pub actor: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipients: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn base(event: &str, actor: &str) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event: event.to_string(),
            actor: actor.to_string(),
            ..Self::default()
        }
    }

    pub fn connect(actor: &str, accepted: bool, reason: Option<&str>) -> Self {
        Self {
            accepted: Some(accepted),
            reason: reason.map(str::to_string),
            ..Self::base("connect", actor)
        }
    }

    pub fn disconnect(actor: &str) -> Self {
        Self {
            accepted: Some(true),
            ..Self::base("disconnect", actor)
        }
    }

    pub fn campaign_submitted(
        actor: &str,
        id: CampaignId,
        recipients: usize,
        attachments: usize,
        body: Option<&str>,
    ) -> Self {
        Self {
            accepted: Some(true),
            campaign_id: Some(id.to_string()),
            recipients: Some(recipients),
            attachments: Some(attachments),
            content: body.map(str::to_string),
            ..Self::base("campaign", actor)
        }
    }

    pub fn campaign_rejected(actor: &str, recipients: usize, reason: &str) -> Self {
        Self {
            accepted: Some(false),
            recipients: Some(recipients),
            reason: Some(reason.to_string()),
            ..Self::base("campaign", actor)
        }
    }

    pub fn campaign_cancelled(actor: &str, id: Option<CampaignId>) -> Self {
        Self {
            accepted: Some(id.is_some()),
            campaign_id: id.map(|i| i.to_string()),
            ..Self::base("cancel", actor)
        }
    }

    pub fn access_denied(actor: &str, route: &str) -> Self {
        Self {
            accepted: Some(false),
            reason: Some(format!("access denied for {route}")),
            ..Self::base("auth", actor)
        }
    }
}

/// Append-only audit trail of operator actions.
#[derive(Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        if let Some(s) = &event.content {
            event.content = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }
        if let Some(s) = &event.reason {
            event.reason = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }

        let out = if self.json {
            let mut line = serde_json::to_string(&event)?;
            line.push('\n');
            line
        } else {
            render_block(&event)?
        };

        // Concurrent handlers must not interleave partial records.
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Store("audit log lock poisoned".to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(out.as_bytes())?;
        Ok(())
    }

    /// Write, logging instead of failing: an audit hiccup never blocks an operator action.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write(event) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write audit event");
        }
    }
}

fn render_block(event: &AuditEvent) -> Result<String> {
    let mut out = String::new();
    out.push('\n');
    out.push_str(&"=".repeat(60));

    let value = serde_json::to_value(event)?;
    let Some(obj) = value.as_object() else {
        return Err(Error::Store("audit event is not a JSON object".to_string()));
    };
    for (k, v) in obj {
        out.push('\n');
        out.push_str(k);
        out.push_str(": ");
        out.push_str(&json_value_to_display(v));
    }
    out.push('\n');
    Ok(out)
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

fn json_value_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}.log"))
    }

    #[test]
    fn truncate_text_adds_ellipsis() {
        let s = "a".repeat(AUDIT_MAX_TEXT + 10);
        let t = truncate_text(&s, AUDIT_MAX_TEXT);
        assert!(t.ends_with("..."));
        assert_eq!(t.chars().count(), AUDIT_MAX_TEXT + 3);
    }

    #[test]
    fn truncate_text_counts_chars_not_bytes() {
        let bengali = "আমি বাংলায় গান গাই";
        assert!(bengali.len() > 20);
        assert_eq!(truncate_text(bengali, 20), bengali);
        assert_eq!(truncate_text(bengali, 3), "আমি...");
    }

    #[test]
    fn json_mode_writes_one_line_per_event_and_truncates_body() {
        let log = AuditLogger::new(tmp_file("outreach-audit-json"), true);
        let body = "x".repeat(AUDIT_MAX_TEXT + 1);
        log.write(AuditEvent::campaign_submitted(
            "token:ab**",
            CampaignId::new(),
            3,
            1,
            Some(&body),
        ))
        .unwrap();
        log.write(AuditEvent::disconnect("anonymous")).unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "campaign");
        assert_eq!(first["recipients"], 3);
        assert!(first["content"].as_str().unwrap().ends_with("..."));
        let _ = std::fs::remove_file(log.path());
    }

    #[test]
    fn text_mode_renders_key_value_block() {
        let log = AuditLogger::new(tmp_file("outreach-audit-text"), false);
        log.write(AuditEvent::campaign_rejected("anonymous", 2, "not authenticated"))
            .unwrap();
        let written = std::fs::read_to_string(log.path()).unwrap();
        assert!(written.contains("event: campaign"));
        assert!(written.contains("accepted: false"));
        assert!(written.contains("reason: not authenticated"));
        let _ = std::fs::remove_file(log.path());
    }
}
