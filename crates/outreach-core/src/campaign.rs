//! Campaign request model: recipients, body, attachments and per-recipient outcomes.

use std::{fmt, sync::OnceLock};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use serde::Serialize;

use crate::{domain::Address, errors::Error, Result};

/// E.164 caps a full international number at 15 digits.
const MAX_ADDRESS_DIGITS: usize = 15;

pub const DEFAULT_DOCUMENT_MIMETYPE: &str = "application/octet-stream";

/// Coarse attachment category driving which transport send method is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MimeClass {
    Image,
    Video,
    Document,
}

impl MimeClass {
    /// Classify a MIME type. Anything that is not `image/*` or `video/*`
    /// (including unknown or empty types) is a document.
    pub fn from_mimetype(mimetype: &str) -> Self {
        let m = mimetype.trim().to_ascii_lowercase();
        if m.starts_with("image/") {
            MimeClass::Image
        } else if m.starts_with("video/") {
            MimeClass::Video
        } else {
            MimeClass::Document
        }
    }

    /// Image and video go out as inline media; documents keep their filename.
    pub fn is_inline(self) -> bool {
        matches!(self, MimeClass::Image | MimeClass::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MimeClass::Image => "image",
            MimeClass::Video => "video",
            MimeClass::Document => "document",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub mime_class: MimeClass,
    pub mimetype: String,
    pub filename: String,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("bytes", &self.bytes.len())
            .field("mime_class", &self.mime_class)
            .field("mimetype", &self.mimetype)
            .field("filename", &self.filename)
            .finish()
    }
}

impl Attachment {
    pub fn new(bytes: Vec<u8>, mimetype: impl Into<String>, filename: impl Into<String>) -> Self {
        let mimetype = mimetype.into();
        Self {
            bytes,
            mime_class: MimeClass::from_mimetype(&mimetype),
            mimetype,
            filename: filename.into(),
        }
    }

    /// Decode an uploaded attachment.
    ///
    /// `data` is plain base64 or a data URL (`data:image/png;base64,....`). A
    /// missing mimetype falls back to the data URL's, then to
    /// `application/octet-stream`; a missing filename becomes `document_{index}`.
    pub fn from_base64(
        data: &str,
        mimetype: Option<&str>,
        filename: Option<&str>,
        index: usize,
    ) -> Result<Self> {
        let (header, payload) = match data.split_once(',') {
            Some((h, p)) => (Some(h), p),
            None => (None, data),
        };

        let bytes = STANDARD.decode(payload.trim()).map_err(|e| {
            Error::InvalidRequest(format!("attachment {index}: invalid base64 payload: {e}"))
        })?;

        let mimetype = mimetype
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| header.and_then(data_url_mimetype))
            .unwrap_or_else(|| DEFAULT_DOCUMENT_MIMETYPE.to_string());

        let filename = filename
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("document_{index}"));

        Ok(Self::new(bytes, mimetype, filename))
    }
}

fn data_url_mimetype(header: &str) -> Option<String> {
    let rest = header.strip_prefix("data:")?;
    let mime = rest.split(';').next()?.trim();
    if mime.is_empty() {
        None
    } else {
        Some(mime.to_string())
    }
}

/// One broadcast job. Consumed by exactly one dispatcher run.
#[derive(Clone, Debug)]
pub struct CampaignRequest {
    /// Recipients in caller priority order. Duplicates are delivered twice.
    pub recipients: Vec<String>,
    pub body: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl CampaignRequest {
    pub fn new(
        recipients: Vec<String>,
        body: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Self> {
        let req = Self {
            recipients,
            body: body.filter(|b| !b.trim().is_empty()),
            attachments,
        };
        req.validate()?;
        Ok(req)
    }

    pub fn validate(&self) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(Error::InvalidRequest(
                "at least one recipient is required".to_string(),
            ));
        }
        let has_body = self.body.as_deref().is_some_and(|b| !b.trim().is_empty());
        if !has_body && self.attachments.is_empty() {
            return Err(Error::InvalidRequest(
                "a message body or at least one attachment is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Map an operator-supplied recipient to its transport address.
///
/// Every non-digit is stripped; an empty or over-long result is malformed.
pub fn resolve_address(raw: &str, domain: &str) -> Result<Address> {
    static NON_DIGITS: OnceLock<Regex> = OnceLock::new();
    let re = NON_DIGITS.get_or_init(|| Regex::new(r"\D+").expect("valid regex"));

    let digits = re.replace_all(raw, "");
    if digits.is_empty() || digits.len() > MAX_ADDRESS_DIGITS {
        return Err(Error::InvalidRequest(format!("malformed address: {raw:?}")));
    }
    Ok(Address(format!("{digits}@{domain}")))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

/// Per-recipient result, held in memory for progress reporting only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    /// Position of the recipient in the submitted list.
    pub index: usize,
    pub recipient: String,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn sent(index: usize, recipient: impl Into<String>) -> Self {
        Self {
            index,
            recipient: recipient.into(),
            status: DeliveryStatus::Sent,
            error: None,
        }
    }

    pub fn failed(index: usize, recipient: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            index,
            recipient: recipient.into(),
            status: DeliveryStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_class_falls_back_to_document() {
        assert_eq!(MimeClass::from_mimetype("image/jpeg"), MimeClass::Image);
        assert_eq!(MimeClass::from_mimetype("VIDEO/mp4"), MimeClass::Video);
        assert_eq!(MimeClass::from_mimetype("application/pdf"), MimeClass::Document);
        assert_eq!(MimeClass::from_mimetype(""), MimeClass::Document);
        assert_eq!(MimeClass::from_mimetype("audio/ogg"), MimeClass::Document);
    }

    #[test]
    fn attachment_strips_data_url_prefix_and_defaults() {
        let a = Attachment::from_base64("data:image/png;base64,aGVsbG8=", None, None, 3).unwrap();
        assert_eq!(a.bytes, b"hello");
        assert_eq!(a.mimetype, "image/png");
        assert_eq!(a.mime_class, MimeClass::Image);
        assert_eq!(a.filename, "document_3");

        let b = Attachment::from_base64("aGVsbG8=", Some(""), Some("q.pdf"), 0).unwrap();
        assert_eq!(b.mimetype, DEFAULT_DOCUMENT_MIMETYPE);
        assert_eq!(b.mime_class, MimeClass::Document);
        assert_eq!(b.filename, "q.pdf");
    }

    #[test]
    fn attachment_rejects_bad_base64() {
        let err = Attachment::from_base64("not base64!!", None, None, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn request_requires_recipients_and_content() {
        assert!(CampaignRequest::new(vec![], Some("hi".into()), vec![]).is_err());
        assert!(CampaignRequest::new(vec!["+1".into()], Some("   ".into()), vec![]).is_err());
        assert!(CampaignRequest::new(vec!["+1".into()], None, vec![]).is_err());

        let att = Attachment::new(vec![1], "image/png", "a.png");
        let req = CampaignRequest::new(vec!["+1".into()], Some(String::new()), vec![att]).unwrap();
        assert!(req.body.is_none());
    }

    #[test]
    fn request_keeps_duplicate_recipients() {
        let req =
            CampaignRequest::new(vec!["+1".into(), "+1".into()], Some("x".into()), vec![]).unwrap();
        assert_eq!(req.recipients.len(), 2);
    }

    #[test]
    fn resolve_address_strips_non_digits() {
        let a = resolve_address("+880 (17) 1234-5678", "s.whatsapp.net").unwrap();
        assert_eq!(a.as_str(), "8801712345678@s.whatsapp.net");
    }

    #[test]
    fn resolve_address_rejects_empty_and_overlong() {
        assert!(resolve_address("n/a", "s.whatsapp.net").is_err());
        assert!(resolve_address("1234567890123456", "s.whatsapp.net").is_err());
    }
}
