//! Types for the Nostr relay wire protocol used by the auditor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A raw event pulled from the relay, exactly as the relay serialized it.
///
/// Events are append-only facts; the auditor never mutates one. The signature
/// is carried but not validated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// The event id (hex).
    pub id: String,
    /// The event kind (classification code).
    pub kind: u32,
    /// The author pubkey (hex).
    pub pubkey: String,
    /// Creation timestamp in seconds.
    pub created_at: i64,
    /// Ordered tag rows; the first element of each row is the tag name.
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Free-form content, either empty or a string-encoded JSON payload.
    #[serde(default)]
    pub content: String,
    /// The event signature (hex), unvalidated.
    #[serde(default)]
    pub sig: String,
}

impl RawEvent {
    /// Value of the first tag row named `name`, i.e. its second element.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|row| row.first().map(String::as_str) == Some(name))
            .and_then(|row| row.get(1))
            .map(String::as_str)
    }
}

/// A Nostr subscription filter, serialized as the third element of a REQ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    /// Event kinds to match.
    pub kinds: Vec<u32>,
    /// Author pubkeys to match, if restricted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    /// Maximum number of stored events per round.
    pub limit: u64,
    /// Upper-bound timestamp for stored events (inclusive on the wire).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    /// Tag filters keyed by `"#<tagname>"`, e.g. `"#t"`.
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new(kinds: Vec<u32>, limit: u64) -> Self {
        Self {
            kinds,
            authors: None,
            limit,
            until: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn tag(mut self, name: &str, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", name), values);
        self
    }

    pub fn until(mut self, until: Option<i64>) -> Self {
        self.until = until;
        self
    }
}

/// One inbound frame from the relay.
///
/// `parse` never fails: payloads that are not JSON or do not have the shape
/// the protocol requires come back as `Malformed`, and well-formed messages
/// the auditor has no use for come back as `Unknown`. Noise on an open relay
/// socket must not abort a run.
#[derive(Debug, Clone)]
pub enum Frame {
    /// `["EVENT", subscription_id, event]`
    Event {
        subscription_id: String,
        event: RawEvent,
    },
    /// `["EOSE", subscription_id]` - end of stored events for a subscription.
    EndOfStoredEvents { subscription_id: String },
    /// `["NOTICE", text]` - human-readable relay message.
    Notice(String),
    /// Structurally invalid payload (non-JSON, wrong shape, bad event body).
    Malformed,
    /// Valid message the engine does not interpret (OK, AUTH, ...).
    Unknown,
}

impl Frame {
    pub fn parse(text: &str) -> Frame {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return Frame::Malformed;
        };
        let Some(items) = value.as_array() else {
            return Frame::Malformed;
        };
        match items.first().and_then(|v| v.as_str()) {
            Some("EVENT") => {
                let Some(subscription_id) = items.get(1).and_then(|v| v.as_str()) else {
                    return Frame::Malformed;
                };
                let Some(event) = items.get(2) else {
                    return Frame::Malformed;
                };
                match serde_json::from_value::<RawEvent>(event.clone()) {
                    Ok(event) => Frame::Event {
                        subscription_id: subscription_id.to_string(),
                        event,
                    },
                    Err(_) => Frame::Malformed,
                }
            }
            Some("EOSE") => match items.get(1).and_then(|v| v.as_str()) {
                Some(subscription_id) => Frame::EndOfStoredEvents {
                    subscription_id: subscription_id.to_string(),
                },
                None => Frame::Malformed,
            },
            Some("NOTICE") => Frame::Notice(
                items
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            ),
            Some(_) => Frame::Unknown,
            None => Frame::Malformed,
        }
    }
}

/// Error types for relay connection and transport
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to connect to relay: {0}")]
    Connect(tokio_tungstenite::tungstenite::Error),

    #[error("relay transport failed: {0}")]
    Transport(tokio_tungstenite::tungstenite::Error),

    #[error("relay closed the connection before the subscription completed")]
    Closed,
}
