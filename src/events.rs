use serde::de::DeserializeOwned;

use crate::subscription::TopicKind;

/// Body of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The frame body exactly as received.
    Raw(Vec<u8>),
    /// The frame body parsed as JSON.
    Json(serde_json::Value),
}

impl Payload {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Raw(data) => Some(data),
            Payload::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    /// Deserializes the payload into `T`, whichever form it arrived in.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        match self {
            Payload::Raw(data) => crate::utils::decode_json(data),
            Payload::Json(value) => T::deserialize(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// InboundMessage is one frame delivered to the `Client::on_message` handler,
/// tagged with the topic it arrived on.
pub struct InboundMessage {
    pub kind: TopicKind,
    pub destination: String,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// ConnectedEvent is a connected event context passed to `Client::on_connected` callback.
pub struct ConnectedEvent {
    pub version: String,
    pub session: Option<String>,
    pub server: Option<String>,
    pub identity: Option<String>,
}
