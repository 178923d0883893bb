//! Value-change events and the JSON envelope they travel in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;

/// A single "the value changed" notification.
///
/// Created by an event source with no sequence (`sequence == 0`). The
/// broadcast engine stamps the sequence when it accepts the event; the stamped
/// copy is what subscribers see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueChangeEvent {
    value: String,
    sequence: u64,
    emitted_at: DateTime<Utc>,
}

impl ValueChangeEvent {
    /// A fresh, unsequenced event emitted now.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            sequence: 0,
            emitted_at: Utc::now(),
        }
    }

    /// Consume the event and return it stamped with `sequence`.
    #[must_use]
    pub fn with_sequence(self, sequence: u64) -> Self {
        Self { sequence, ..self }
    }

    /// The new value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Engine-assigned sequence number, `0` while unassigned.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether the engine has stamped this event.
    pub fn is_sequenced(&self) -> bool {
        self.sequence != 0
    }

    /// When the source emitted the event.
    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    /// Serialize into the `value.changed` wire envelope.
    pub fn to_wire_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireMessage::ValueChanged {
            sequence: self.sequence,
            value: self.value.clone(),
            emitted_at: self.emitted_at,
        })
    }
}

/// Text-frame payloads sent from the server to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// First frame on every subscriber connection.
    #[serde(rename = "connection.established")]
    ConnectionEstablished {
        /// Connection details.
        data: EstablishedData,
        /// Server time at accept.
        timestamp: DateTime<Utc>,
    },
    /// A broadcast value change.
    #[serde(rename = "value.changed", rename_all = "camelCase")]
    ValueChanged {
        /// Engine sequence number.
        sequence: u64,
        /// The new value.
        value: String,
        /// When the source emitted it.
        emitted_at: DateTime<Utc>,
    },
}

/// Body of [`WireMessage::ConnectionEstablished`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstablishedData {
    /// Id the server assigned to this connection.
    pub connection_id: ConnectionId,
}

impl WireMessage {
    /// Build the greeting for a newly opened connection.
    pub fn established(connection_id: ConnectionId) -> Self {
        Self::ConnectionEstablished {
            data: EstablishedData { connection_id },
            timestamp: Utc::now(),
        }
    }
}
