//! Messages flowing through the broker and into storage.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::topic::Ssid;

/// A message on a specific topic, as routed and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sequence assigned by the sequence generator, monotonic per topic key.
    pub message_seq: i64,
    /// Globally unique id of this message.
    pub guid: String,
    /// Publisher identity.
    pub username: String,
    pub client_id: String,
    /// Original topic name of this message.
    pub topic_name: String,
    pub ssid: Ssid,
    pub qos: u8,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Creation timestamp, nanoseconds since the Unix epoch.
    pub created_at: i64,
    /// Optional expiry timestamp (nanoseconds); no sweeper, query-side only.
    pub ttl_until: Option<i64>,
    /// Application message type tag.
    pub message_type: String,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guid: String,
        username: String,
        client_id: String,
        topic_name: String,
        ssid: Ssid,
        qos: u8,
        ttl_until: Option<i64>,
        payload: Vec<u8>,
    ) -> Self {
        debug_assert_eq!(ssid.len(), topic_name.split('/').count());
        Self {
            message_seq: 0,
            guid,
            username,
            client_id,
            topic_name,
            ssid,
            qos,
            payload,
            created_at: now_ns(),
            ttl_until,
            message_type: String::new(),
        }
    }

    pub fn set_message_seq(&mut self, message_seq: i64) {
        self.message_seq = message_seq;
    }
}

/// Current time in nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Publisher identity embedded in a structured payload.
///
/// When `structuredPayload` is enabled, publish payloads are JSON envelopes
/// carrying the publisher's identity, which the broker cross-checks against
/// the connection before accepting the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEnvelope {
    pub username: String,
    pub client_id: String,
    pub topic_name: String,
    pub qos: u8,
}

impl PublishEnvelope {
    /// Decode an envelope from payload bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            BrokerError::ProtocolViolation(format!("malformed publish envelope: {}", e))
        })
    }

    /// Cross-check the embedded identity against the publishing connection.
    pub fn validate(&self, username: &str, client_id: &str, topic: &str, qos: u8) -> Result<()> {
        if self.username != username {
            return Err(BrokerError::MismatchUsername);
        }
        if self.client_id != client_id {
            return Err(BrokerError::MismatchClientId);
        }
        if self.topic_name != topic {
            return Err(BrokerError::MismatchTopic);
        }
        if self.qos != qos {
            return Err(BrokerError::MismatchQoS);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Parser;

    #[test]
    fn test_message_ssid_matches_segments() {
        let topic = Parser::new("a/b/c").parse().unwrap();
        let msg = Message::new(
            "guid-1".into(),
            "alice".into(),
            "client-1".into(),
            topic.topic_name().to_string(),
            topic.to_ssid(),
            1,
            None,
            b"payload".to_vec(),
        );
        assert_eq!(msg.ssid.len(), 3);
        assert_eq!(msg.message_seq, 0);
    }

    #[test]
    fn test_envelope_validate() {
        let env = PublishEnvelope {
            username: "alice".into(),
            client_id: "c1".into(),
            topic_name: "a/b".into(),
            qos: 1,
        };
        assert!(env.validate("alice", "c1", "a/b", 1).is_ok());
        assert!(matches!(
            env.validate("bob", "c1", "a/b", 1),
            Err(BrokerError::MismatchUsername)
        ));
        assert!(matches!(
            env.validate("alice", "c2", "a/b", 1),
            Err(BrokerError::MismatchClientId)
        ));
        assert!(matches!(
            env.validate("alice", "c1", "a/c", 1),
            Err(BrokerError::MismatchTopic)
        ));
        assert!(matches!(
            env.validate("alice", "c1", "a/b", 0),
            Err(BrokerError::MismatchQoS)
        ));
    }

    #[test]
    fn test_envelope_json_roundtrip() {
        let env = PublishEnvelope {
            username: "alice".into(),
            client_id: "c1".into(),
            topic_name: "a/b".into(),
            qos: 0,
        };
        let bytes = serde_json::to_vec(&env).unwrap();
        let decoded = PublishEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded.username, "alice");
        assert_eq!(decoded.client_id, "c1");
    }
}
