//! All AirClip payload types.
//!
//! - [`PresenceRecord`] travels on the discovery socket as JSON inside an
//!   envelope tagged [`ProtocolId::PRESENCE`](crate::ProtocolId::PRESENCE).
//! - [`TransferFrame`] travels on transfer connections, bincode-encoded inside
//!   a length-prefixed frame.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::endpoint::EndPoint;

// ── Discovery payloads ────────────────────────────────────────────────────────

/// Liveness declared by a presence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// The discovery wire record: "this endpoint is online/offline".
///
/// `node_id` identifies the announcing process.  Receivers use it to drop
/// their own broadcast echoes; records without one are still accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub from: EndPoint,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Uuid>,
}

impl PresenceRecord {
    pub fn online(from: EndPoint) -> Self {
        Self {
            from,
            status: PresenceStatus::Online,
            node_id: None,
        }
    }

    pub fn offline(from: EndPoint) -> Self {
        Self {
            from,
            status: PresenceStatus::Offline,
            node_id: None,
        }
    }

    pub fn with_node_id(mut self, node_id: Uuid) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Serializes the record as the JSON envelope payload.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses an envelope payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

// ── Transfer payloads ─────────────────────────────────────────────────────────

/// Who sent a message and when (Unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sender: String,
    pub send_time: i64,
}

impl MessageHeader {
    /// Creates a header stamped with the current time.
    pub fn now(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            send_time: unix_now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub content: String,
}

/// A text payload exchanged between peers.
///
/// The header is filled in by the sending side when absent; receivers treat
/// it as read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub header: Option<MessageHeader>,
    pub body: MessageBody,
}

impl Message {
    /// Creates a header-less message; the transfer layer stamps it on send.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            header: None,
            body: MessageBody {
                content: content.into(),
            },
        }
    }

    /// Creates a message with a fresh header.
    pub fn stamped(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            header: Some(MessageHeader::now(sender)),
            body: MessageBody {
                content: content.into(),
            },
        }
    }

    /// Fills in the header if the caller did not supply one.
    pub fn stamp_if_absent(&mut self, sender: &str) {
        if self.header.is_none() {
            self.header = Some(MessageHeader::now(sender));
        }
    }

    pub fn content(&self) -> &str {
        &self.body.content
    }

    pub fn sender(&self) -> Option<&str> {
        self.header.as_ref().map(|h| h.sender.as_str())
    }
}

/// Handshake frame, sent once by each side when a transfer connection opens.
///
/// `node_id` is a per-process random id used only to pick a winner when two
/// nodes dial each other at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub endpoint: EndPoint,
    pub node_id: Uuid,
}

/// Everything that can appear inside a transfer frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFrame {
    Hello(Hello),
    Message(Message),
}

/// Returns the current time as seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
