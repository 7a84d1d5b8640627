use crate::ai::Diagnosis;
use crate::error::ErrorKind;
use crate::events::{FailureEvent, Severity, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Maximum title length accepted by the notification API, in bytes
pub const MAX_TITLE_BYTES: usize = 256;
/// Maximum description length accepted by the notification API, in bytes
pub const MAX_DESCRIPTION_BYTES: usize = 4096;

/// Payload excerpt length carried in notifications
const PAYLOAD_PREVIEW_CHARS: usize = 500;

/// Cause reported when no diagnosis could be obtained
pub const FALLBACK_CAUSE: &str = "analysis failed";

/// Bus metadata of the event a notification is about
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    pub key: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub headers: BTreeMap<String, String>,
    pub received_at: Timestamp,
    pub payload_preview: String,
}

impl EventMetadata {
    pub fn from_event(event: &FailureEvent) -> Self {
        Self {
            key: event.key.clone(),
            topic: event.topic.clone(),
            partition: event.offset.partition,
            offset: event.offset.position,
            headers: event.headers.clone(),
            received_at: event.received_at,
            payload_preview: event.payload_preview(PAYLOAD_PREVIEW_CHARS),
        }
    }
}

/// Structured notification content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationBody {
    pub cause: String,
    pub suggested_action: Option<String>,
    pub confidence: Option<f64>,
    /// Set only on fallback notifications
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    /// Analysis attempts made before this notification was built
    pub attempts: u32,
    pub event: EventMetadata,
}

/// A notification ready to hand to the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPayload {
    pub title: String,
    pub body: NotificationBody,
    pub severity: Severity,
    /// Key of the event this notification is about; used for idempotency
    pub source_event_key: String,
}

impl NotificationPayload {
    /// Notification carrying a successful diagnosis
    pub fn diagnosed(
        event: &FailureEvent,
        diagnosis: &Diagnosis,
        attempts: u32,
        title: &str,
    ) -> Self {
        Self {
            title: truncate_text(title, MAX_TITLE_BYTES),
            body: NotificationBody {
                cause: diagnosis.cause.clone(),
                suggested_action: Some(diagnosis.suggested_action.clone()),
                confidence: Some(diagnosis.confidence),
                error_kind: None,
                error_detail: None,
                attempts,
                event: EventMetadata::from_event(event),
            },
            severity: Severity::Normal,
            source_event_key: event.key.clone(),
        }
    }

    /// Notification sent when no diagnosis could be obtained
    ///
    /// Carries the last error and the raw event metadata so an operator can
    /// still act on the failure.
    pub fn fallback(
        event: &FailureEvent,
        kind: ErrorKind,
        detail: &str,
        attempts: u32,
        title: &str,
    ) -> Self {
        Self {
            title: truncate_text(&format!("{} (analysis unavailable)", title), MAX_TITLE_BYTES),
            body: NotificationBody {
                cause: FALLBACK_CAUSE.to_string(),
                suggested_action: None,
                confidence: None,
                error_kind: Some(kind),
                error_detail: Some(detail.to_string()),
                attempts,
                event: EventMetadata::from_event(event),
            },
            severity: Severity::High,
            source_event_key: event.key.clone(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.body.error_kind.is_some()
    }

    /// Markdown description sent to the notification API
    pub fn description(&self) -> String {
        let body = &self.body;
        let event = &body.event;
        let mut text = String::new();

        if let Some(kind) = body.error_kind {
            let _ = writeln!(
                text,
                "The failed message could not be analyzed after {} attempt(s).\n",
                body.attempts
            );
            let _ = writeln!(text, "**Cause:** {}", body.cause);
            let _ = writeln!(text, "**Error:** {}", kind);
            if let Some(detail) = &body.error_detail {
                let _ = writeln!(text, "**Details:** {}", detail);
            }
        } else {
            let _ = writeln!(text, "**Likely cause:** {}", body.cause);
            if let Some(action) = &body.suggested_action {
                let _ = writeln!(text, "**Suggested action:** {}", action);
            }
            if let Some(confidence) = body.confidence {
                let _ = writeln!(text, "**Confidence:** {:.0}%", confidence * 100.0);
            }
        }

        let _ = writeln!(text, "\n**Message metadata:**");
        let _ = writeln!(text, "- Key: {}", event.key);
        let _ = writeln!(text, "- Topic: {}", event.topic);
        let _ = writeln!(text, "- Partition: {}", event.partition);
        let _ = writeln!(text, "- Offset: {}", event.offset);
        let _ = writeln!(text, "- Received: {}", event.received_at.to_rfc3339());
        for (name, value) in &event.headers {
            let _ = writeln!(text, "- Header {}: {}", name, value);
        }
        let _ = write!(text, "\n**Message:**\n```\n{}\n```", event.payload_preview);

        truncate_text(&text, MAX_DESCRIPTION_BYTES)
    }
}

/// Truncate text to at most `max_length` bytes, ending in "..." when cut
///
/// Never splits a UTF-8 character.
pub fn truncate_text(text: &str, max_length: usize) -> String {
    if text.len() <= max_length {
        return text.to_string();
    }

    let mut truncate_at = max_length.saturating_sub(3);
    while truncate_at > 0 && !text.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }

    format!("{}...", &text[..truncate_at])
}


// Property-based tests
#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_truncate_respects_limit(text: String, max_length: u8) -> bool {
        let max_length = usize::from(max_length).max(3);
        let truncated = truncate_text(&text, max_length);
        truncated.len() <= max_length
    }

    #[quickcheck]
    fn prop_truncate_keeps_prefix(text: String, max_length: u8) -> bool {
        let max_length = usize::from(max_length).max(3);
        let truncated = truncate_text(&text, max_length);
        let kept = truncated.strip_suffix("...").unwrap_or(&truncated);
        text.starts_with(kept)
    }
}
