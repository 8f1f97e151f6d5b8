//! Wire messages exchanged between processes.
//!
//! Messages are text framed and colon delimited:
//!
//! ```text
//! reqEntry:<senderId>:<requestTimestamp>
//! respOK:<senderId>:<clockAtSend>
//! TAKE_SNAPSHOT:<senderId>:<snapshotId>
//! ```
//!
//! Inbound text is parsed exactly once at the transport boundary. Everything
//! past that point works on [`DmxMessage`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::MessageError;

/// Tag of a request-for-entry message.
pub const REQ_ENTRY_TAG: &str = "reqEntry";
/// Tag of a grant message.
pub const RESP_OK_TAG: &str = "respOK";
/// Tag of a snapshot marker.
pub const MARKER_TAG: &str = "TAKE_SNAPSHOT";

/// Largest timestamp or snapshot id accepted from the wire.
///
/// Half the `u64` range, so clocks and snapshot ids derived from a received
/// value can never overflow.
pub const MAX_WIRE_VALUE: u64 = u64::MAX >> 1;

/// Protocol messages.
///
/// Serialized as its wire text so persisted snapshots read like the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DmxMessage {
    /// Request for access, broadcast on ENTER.
    ReqEntry {
        /// Requesting process.
        sender: u32,
        /// Request timestamp (the requester's clock after its tick).
        timestamp: u64,
    },

    /// Grant, sent immediately or deferred until the granter's EXIT.
    RespOk {
        /// Granting process.
        sender: u32,
        /// Granter's clock at send time.
        timestamp: u64,
    },

    /// Chandy-Lamport marker.
    Marker {
        /// Process that forwarded the marker on this channel.
        sender: u32,
        /// Snapshot this marker belongs to.
        snapshot_id: u64,
    },
}

impl DmxMessage {
    /// Process the message came from (the channel it arrived on).
    pub fn sender(&self) -> u32 {
        match self {
            DmxMessage::ReqEntry { sender, .. }
            | DmxMessage::RespOk { sender, .. }
            | DmxMessage::Marker { sender, .. } => *sender,
        }
    }

    /// Lamport timestamp carried by the message, if any.
    ///
    /// Markers carry a snapshot id, not a timestamp.
    pub fn timestamp(&self) -> Option<u64> {
        match self {
            DmxMessage::ReqEntry { timestamp, .. } | DmxMessage::RespOk { timestamp, .. } => {
                Some(*timestamp)
            }
            DmxMessage::Marker { .. } => None,
        }
    }

    /// True for snapshot markers, false for ordinary protocol messages.
    pub fn is_marker(&self) -> bool {
        matches!(self, DmxMessage::Marker { .. })
    }

    /// Encode to the wire form.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse a wire body.
    pub fn parse(body: &str) -> Result<Self, MessageError> {
        let body = body.trim_end_matches(['\r', '\n']);
        let mut parts = body.split(':');

        let (tag, sender, value) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(tag), Some(sender), Some(value), None) => (tag, sender, value),
            _ => {
                return Err(MessageError::BadFraming {
                    body: body.to_string(),
                })
            }
        };

        let sender = sender.parse::<u32>().map_err(|_| MessageError::BadField {
            field: "sender",
            value: sender.to_string(),
        })?;
        let value_field = if tag == MARKER_TAG { "snapshot_id" } else { "timestamp" };
        let value = value
            .parse::<u64>()
            .ok()
            .filter(|v| *v <= MAX_WIRE_VALUE)
            .ok_or_else(|| MessageError::BadField {
                field: value_field,
                value: value.to_string(),
            })?;

        match tag {
            REQ_ENTRY_TAG => Ok(DmxMessage::ReqEntry { sender, timestamp: value }),
            RESP_OK_TAG => Ok(DmxMessage::RespOk { sender, timestamp: value }),
            MARKER_TAG => Ok(DmxMessage::Marker { sender, snapshot_id: value }),
            other => Err(MessageError::UnknownKind {
                tag: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DmxMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmxMessage::ReqEntry { sender, timestamp } => {
                write!(f, "{}:{}:{}", REQ_ENTRY_TAG, sender, timestamp)
            }
            DmxMessage::RespOk { sender, timestamp } => {
                write!(f, "{}:{}:{}", RESP_OK_TAG, sender, timestamp)
            }
            DmxMessage::Marker { sender, snapshot_id } => {
                write!(f, "{}:{}:{}", MARKER_TAG, sender, snapshot_id)
            }
        }
    }
}

impl FromStr for DmxMessage {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DmxMessage::parse(s)
    }
}

impl From<DmxMessage> for String {
    fn from(msg: DmxMessage) -> String {
        msg.encode()
    }
}

impl TryFrom<String> for DmxMessage {
    type Error = MessageError;

    fn try_from(body: String) -> Result<Self, Self::Error> {
        DmxMessage::parse(&body)
    }
}
