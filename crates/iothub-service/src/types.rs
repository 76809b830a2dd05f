//! Public types for the iothub-service crate.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Application property that carries the requested feedback type.
pub const ACK_PROPERTY: &str = "iothub-ack";

/// A cloud-to-device or device-to-cloud message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub to: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub enqueued_time: Option<DateTime<Utc>>,

    pub connection_device_id: Option<String>,
    pub connection_device_generation_id: Option<String>,
    pub connection_auth_method: Option<String>,
    pub message_source: Option<String>,

    /// Application properties plus any non-reserved annotations.
    pub properties: HashMap<String, String>,
}

/// Delivery outcome of a previously sent cloud-to-device message. Fields
/// missing from a record are left at their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Feedback {
    pub original_message_id: String,
    pub description: String,
    pub device_generation_id: String,
    pub device_id: String,
    pub enqueued_time_utc: DateTime<Utc>,
    pub status_code: String,
}

/// Which delivery outcomes produce a [`Feedback`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    /// No feedback.
    None,
    /// Feedback when the device completed the message.
    Positive,
    /// Feedback when the message expired or hit the max delivery count.
    Negative,
    /// Both positive and negative.
    Full,
}

impl AckType {
    pub fn as_str(self) -> &'static str {
        match self {
            AckType::None => "none",
            AckType::Positive => "positive",
            AckType::Negative => "negative",
            AckType::Full => "full",
        }
    }
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AckType::None),
            "positive" => Ok(AckType::Positive),
            "negative" => Ok(AckType::Negative),
            "full" => Ok(AckType::Full),
            other => Err(Error::InvalidArgument(format!("unknown ack type: {other:?}"))),
        }
    }
}

/// Options for [`ServiceClient::send`](crate::ServiceClient::send).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    /// Requested feedback; stored in the `iothub-ack` property.
    pub ack: Option<AckType>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub properties: HashMap<String, String>,
}

impl SendOptions {
    /// Set the ack type from its string form. `""` clears it. Unknown values
    /// are rejected and leave `self` untouched.
    pub fn set_ack(&mut self, ack: &str) -> Result<(), Error> {
        let parsed = match ack {
            "" => None,
            other => Some(other.parse::<AckType>()?),
        };
        self.ack = parsed;
        Ok(())
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties<I, K, V>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.properties
            .extend(props.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.properties.keys().any(String::is_empty) {
            return Err(Error::InvalidArgument("property key is empty".into()));
        }
        if let Some(raw) = self.properties.get(ACK_PROPERTY)
            && !raw.is_empty()
        {
            raw.parse::<AckType>()?;
        }
        Ok(())
    }

    /// Copy every option onto `msg`. The explicit `ack` wins over a raw
    /// `iothub-ack` property.
    pub(crate) fn apply(&self, msg: &mut Message) {
        if let Some(ref id) = self.message_id {
            msg.message_id = Some(id.clone());
        }
        if let Some(ref id) = self.correlation_id {
            msg.correlation_id = Some(id.clone());
        }
        if let Some(ref id) = self.user_id {
            msg.user_id = Some(id.clone());
        }
        if let Some(t) = self.expiry_time {
            msg.expiry_time = Some(t);
        }
        msg.properties.extend(self.properties.clone());
        if let Some(ack) = self.ack {
            msg.properties
                .insert(ACK_PROPERTY.to_string(), ack.as_str().to_string());
        }
    }
}

/// Options for a direct-method call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// How long the hub waits for the device to connect.
    pub connect_timeout: Option<Duration>,
    /// How long the hub waits for the method result.
    pub response_timeout: Option<Duration>,
}

impl CallOptions {
    pub fn validate(&self) -> Result<(), Error> {
        whole_seconds("connect_timeout", self.connect_timeout)?;
        whole_seconds("response_timeout", self.response_timeout)?;
        Ok(())
    }
}

pub(crate) fn whole_seconds(name: &str, d: Option<Duration>) -> Result<Option<u32>, Error> {
    let Some(d) = d else {
        return Ok(None);
    };
    if d.subsec_nanos() != 0 || d.is_zero() {
        return Err(Error::InvalidArgument(format!(
            "{name} must be a positive whole number of seconds, got {d:?}"
        )));
    }
    u32::try_from(d.as_secs())
        .map(Some)
        .map_err(|_| Error::InvalidArgument(format!("{name} is too large: {d:?}")))
}

/// Result of a direct-method call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MethodResponse {
    /// Status reported by the device's method handler.
    pub status: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MethodResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X509Thumbprint {
    #[serde(default)]
    pub primary_thumbprint: Option<String>,
    #[serde(default)]
    pub secondary_thumbprint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A device twin as returned by the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Twin {
    pub device_id: String,
    pub etag: String,
    pub device_etag: String,
    pub status: String,
    pub status_reason: String,
    pub status_update_time: String,
    pub connection_state: String,
    pub last_activity_time: String,
    pub cloud_to_device_message_count: i64,
    pub authentication_type: String,
    pub x509_thumbprint: X509Thumbprint,
    pub version: i64,
    pub tags: serde_json::Map<String, serde_json::Value>,
    pub properties: TwinProperties,
    pub capabilities: serde_json::Map<String, serde_json::Value>,

    /// The response body this twin was parsed from.
    #[serde(skip)]
    pub raw_json: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceAuthentication {
    pub x509_thumbprint: X509Thumbprint,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A device identity as returned by the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub generation_id: String,
    pub etag: String,
    pub connection_state: String,
    pub status: String,
    pub status_reason: String,
    pub connection_state_updated_time: String,
    pub status_updated_time: String,
    pub last_activity_time: String,
    pub cloud_to_device_message_count: i64,
    pub authentication: DeviceAuthentication,
    pub capabilities: serde_json::Map<String, serde_json::Value>,

    #[serde(skip)]
    pub raw_json: Vec<u8>,
}
