//! Core event types for the failure-analysis pipeline
//!
//! This module defines the records that flow from the event source through
//! analysis and into notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Position of a record on the bus
///
/// Offsets are only comparable within the same partition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Offset {
    pub partition: i32,
    pub position: i64,
}

impl Offset {
    pub fn new(partition: i32, position: i64) -> Self {
        Self {
            partition,
            position,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.position)
    }
}

/// One message the routing layer could not classify
///
/// Created when pulled from the event source and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureEvent {
    /// Bus message key, or a stable identifier derived from topic and offset
    pub key: String,
    /// Topic the record was read from
    pub topic: String,
    /// Raw record value
    pub payload: Vec<u8>,
    /// Record headers
    pub headers: BTreeMap<String, String>,
    /// Where the record lives on the bus
    pub offset: Offset,
    /// When the record was pulled
    pub received_at: Timestamp,
}

impl FailureEvent {
    /// Build an event, deriving the key when the record has none
    pub fn new(
        key: Option<String>,
        topic: impl Into<String>,
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
        offset: Offset,
    ) -> Self {
        let topic = topic.into();
        let key = match key {
            Some(key) if !key.is_empty() => key,
            _ => Self::derive_key(&topic, offset),
        };

        Self {
            key,
            topic,
            payload,
            headers,
            offset,
            received_at: Utc::now(),
        }
    }

    /// Stable identifier for keyless records; survives redelivery
    pub fn derive_key(topic: &str, offset: Offset) -> String {
        format!("{}-{}-{}", topic, offset.partition, offset.position)
    }

    /// Payload decoded as UTF-8, replacing invalid sequences
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Short payload excerpt for logs and notifications
    pub fn payload_preview(&self, max_chars: usize) -> String {
        let text = self.payload_text();
        if text.chars().count() <= max_chars {
            text
        } else {
            let mut preview: String = text.chars().take(max_chars).collect();
            preview.push_str("...");
            preview
        }
    }
}

/// Severity attached to outgoing notifications
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Normal,
    High,
    Critical,
}
