//! Signaling and presence channel interfaces
//!
//! Both are document collections scoped to one voice channel. Signaling
//! documents are written once, delivered to subscribers once and deleted by
//! their addressee after handling. Presence holds one entry per participant.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{AppError, Result};
use crate::webrtc::IceCandidate;

pub use memory::MemoryHub;

/// Negotiation message between two participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer {
        from: String,
        to: String,
        sdp: String,
    },
    Answer {
        from: String,
        to: String,
        sdp: String,
    },
    IceCandidate {
        from: String,
        to: String,
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    pub fn from(&self) -> &str {
        match self {
            Self::Offer { from, .. } | Self::Answer { from, .. } | Self::IceCandidate { from, .. } => {
                from
            }
        }
    }

    pub fn to(&self) -> &str {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::IceCandidate { to, .. } => to,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn to_document(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_document(body: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(body.clone())
            .map_err(|e| AppError::Signaling(format!("Malformed signaling document: {}", e)))
    }
}

/// Addressee of a raw document, readable even when the rest is malformed
pub fn document_addressee(body: &serde_json::Value) -> Option<&str> {
    body.get("to").and_then(serde_json::Value::as_str)
}

/// Document stored in a signaling collection
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDocument {
    pub id: String,
    pub body: serde_json::Value,
}

/// One participant's presence in a voice channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub uid: String,
    pub display_name: String,
    #[serde(rename = "photoURL", default)]
    pub photo_url: Option<String>,
    /// Epoch milliseconds
    pub joined_at: i64,
    #[serde(default)]
    pub is_screen_sharing: bool,
    #[serde(default)]
    pub is_bot: bool,
    /// Participant who summoned a bot entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summoned_by: Option<String>,
}

impl PresenceEntry {
    pub fn new(uid: impl Into<String>, display_name: impl Into<String>, joined_at: i64) -> Self {
        Self {
            uid: uid.into(),
            display_name: display_name.into(),
            photo_url: None,
            joined_at,
            is_screen_sharing: false,
            is_bot: false,
            summoned_by: None,
        }
    }
}

/// Signaling document collection
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Add a document; returns its id
    async fn add(&self, body: serde_json::Value) -> Result<String>;

    /// Subscribe to new documents. Documents present at subscription time
    /// are delivered first. Dropping the receiver unsubscribes.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalDocument>>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<SignalDocument>>;
}

/// Presence collection
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Create or overwrite the entry keyed by `entry.uid`
    async fn set(&self, entry: PresenceEntry) -> Result<()>;

    async fn update_screen_sharing(&self, uid: &str, sharing: bool) -> Result<()>;

    async fn delete(&self, uid: &str) -> Result<()>;

    /// Subscribe to full snapshots; the current snapshot is delivered first
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Vec<PresenceEntry>>>;
}

/// Resolves the collections of a voice channel
pub trait ChannelDirectory: Send + Sync {
    fn signaling(&self, group_id: &str, channel_id: &str) -> Arc<dyn SignalingChannel>;

    fn presence(&self, group_id: &str, channel_id: &str) -> Arc<dyn PresenceChannel>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let msg = SignalingMessage::IceCandidate {
            from: "alice".to_string(),
            to: "bob".to_string(),
            candidate: IceCandidate::new("candidate:1").with_mid("0", 0),
        };
        let doc = msg.to_document().unwrap();
        assert_eq!(doc["type"], "ice-candidate");
        assert_eq!(doc["candidate"]["sdpMid"], "0");

        let parsed = SignalingMessage::from_document(&json!({
            "type": "offer", "from": "a", "to": "b", "sdp": "v=0"
        }))
        .unwrap();
        assert_eq!(parsed.kind(), "offer");
        assert_eq!(parsed.from(), "a");
        assert_eq!(parsed.to(), "b");
    }

    #[test]
    fn test_malformed_document_keeps_addressee() {
        let body = json!({"type": "offer", "to": "bob"});
        assert!(SignalingMessage::from_document(&body).is_err());
        assert_eq!(document_addressee(&body), Some("bob"));
        assert_eq!(document_addressee(&json!({"to": 3})), None);
    }

    #[test]
    fn test_presence_field_names() {
        let mut entry = PresenceEntry::new("eve", "Eve", 1_700_000_000_000);
        entry.is_bot = true;
        entry.summoned_by = Some("alice".to_string());
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["displayName"], "Eve");
        assert_eq!(json["photoURL"], serde_json::Value::Null);
        assert_eq!(json["joinedAt"], 1_700_000_000_000i64);
        assert_eq!(json["isScreenSharing"], false);
        assert_eq!(json["summonedBy"], "alice");
    }
}
