//! Wire message model, well-known addresses, and the `Message` codec.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::Error;
use crate::types::{Feedback, Message};

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

pub mod address {
    /// Source used to trigger the event endpoint redirect.
    pub const EVENTS: &str = "messages/events/";
    /// Sender target for cloud-to-device messages.
    pub const DEVICEBOUND: &str = "/messages/devicebound";
    /// Receiver source for delivery feedback batches.
    pub const FEEDBACK: &str = "/messages/servicebound/feedback";

    /// `to` property of a cloud-to-device message for `device_id`.
    pub fn device_inbox(device_id: &str) -> String {
        format!("/devices/{device_id}/messages/devicebound")
    }

    /// Receiver source of one event hub partition.
    pub fn partition(group: &str, consumer_group: &str, partition_id: &str) -> String {
        format!("/{group}/ConsumerGroups/{consumer_group}/Partitions/{partition_id}")
    }
}

/// Reserved annotation keys lifted into dedicated [`Message`] fields.
pub mod annotation {
    pub const ENQUEUED_TIME: &str = "iothub-enqueuedtime";
    pub const CONNECTION_DEVICE_ID: &str = "iothub-connection-device-id";
    pub const CONNECTION_GENERATION_ID: &str = "iothub-connection-auth-generation-id";
    pub const CONNECTION_AUTH_METHOD: &str = "iothub-connection-auth-method";
    pub const MESSAGE_SOURCE: &str = "iothub-message-source";
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A primitive protocol value as found in annotations and application
/// properties.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::Null => Ok(()),
            WireValue::Bool(b) => write!(f, "{b}"),
            WireValue::Long(n) => write!(f, "{n}"),
            WireValue::Double(n) => write!(f, "{n}"),
            WireValue::String(s) => f.write_str(s),
            WireValue::Timestamp(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            WireValue::Binary(b) => f.write_str(&String::from_utf8_lossy(b)),
        }
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::String(s)
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::String(s.to_string())
    }
}

/// Standard message properties section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub user_id: Option<Vec<u8>>,
    pub to: Option<String>,
    pub correlation_id: Option<String>,
    pub absolute_expiry_time: Option<DateTime<Utc>>,
}

/// A protocol-level message as exchanged with a [`Transport`](crate::Transport).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireMessage {
    pub data: Vec<Vec<u8>>,
    pub properties: Option<MessageProperties>,
    pub application_properties: BTreeMap<String, WireValue>,
    pub annotations: BTreeMap<String, WireValue>,
}

impl WireMessage {
    /// All data segments joined.
    pub fn body(&self) -> Vec<u8> {
        self.data.concat()
    }
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

pub fn encode_message(msg: &Message) -> WireMessage {
    let application_properties = msg
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), WireValue::String(v.clone())))
        .collect();
    WireMessage {
        data: vec![msg.payload.clone()],
        properties: Some(MessageProperties {
            message_id: msg.message_id.clone(),
            user_id: msg.user_id.as_ref().map(|u| u.clone().into_bytes()),
            to: msg.to.clone(),
            correlation_id: msg.correlation_id.clone(),
            absolute_expiry_time: msg.expiry_time,
        }),
        application_properties,
        annotations: BTreeMap::new(),
    }
}

pub fn decode_message(wire: WireMessage) -> Message {
    let mut m = Message {
        payload: wire.body(),
        ..Default::default()
    };
    m.properties
        .reserve(wire.annotations.len() + wire.application_properties.len());

    if let Some(p) = wire.properties {
        m.message_id = p.message_id;
        m.correlation_id = p.correlation_id;
        m.user_id = p.user_id.map(|u| String::from_utf8_lossy(&u).into_owned());
        m.to = p.to;
        m.expiry_time = p.absolute_expiry_time;
    }

    // Annotations first: an application property with the same key replaces
    // the annotation value.
    for (k, v) in wire.annotations {
        if let Some(v) = lift_annotation(&mut m, &k, v) {
            m.properties.insert(k, v.to_string());
        }
    }
    for (k, v) in wire.application_properties {
        m.properties.insert(k, v.to_string());
    }
    m
}

/// Store a reserved annotation in its dedicated field. Returns the value back
/// when `key` is not reserved or the value has an unexpected type.
fn lift_annotation(m: &mut Message, key: &str, value: WireValue) -> Option<WireValue> {
    match (key, value) {
        (annotation::ENQUEUED_TIME, WireValue::Timestamp(t)) => m.enqueued_time = Some(t),
        (annotation::CONNECTION_DEVICE_ID, WireValue::String(s)) => {
            m.connection_device_id = Some(s);
        }
        (annotation::CONNECTION_GENERATION_ID, WireValue::String(s)) => {
            m.connection_device_generation_id = Some(s);
        }
        (annotation::CONNECTION_AUTH_METHOD, WireValue::String(s)) => {
            m.connection_auth_method = Some(s);
        }
        (annotation::MESSAGE_SOURCE, WireValue::String(s)) => m.message_source = Some(s),
        (_, other) => return Some(other),
    }
    None
}

/// Decode one feedback delivery: a JSON array of records.
pub fn decode_feedback(wire: &WireMessage) -> Result<Vec<Feedback>, Error> {
    Ok(serde_json::from_slice(&wire.body())?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
