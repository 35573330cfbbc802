//! Wire format of the multiplexer control socket.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ProtocolError;

/// Identifies one logical subscription: a subject within a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub target_id: String,
    pub subject_id: String,
}

impl SubscriptionKey {
    pub fn new(target_id: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            subject_id: subject_id.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target_id, self.subject_id)
    }
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE", rename_all_fields = "camelCase")]
pub enum ControlFrame {
    Subscribe { cluster_id: String, user_id: String },
    Unsubscribe { cluster_id: String, user_id: String },
}

impl ControlFrame {
    pub fn subscribe(key: &SubscriptionKey) -> Self {
        Self::Subscribe {
            cluster_id: key.target_id.clone(),
            user_id: key.subject_id.clone(),
        }
    }

    pub fn unsubscribe(key: &SubscriptionKey) -> Self {
        Self::Unsubscribe {
            cluster_id: key.target_id.clone(),
            user_id: key.subject_id.clone(),
        }
    }

    pub fn to_json(&self) -> String {
        // A derived Serialize on string fields cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server → client DATA frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFrame {
    #[serde(deserialize_with = "lenient_id")]
    pub cluster_id: String,
    #[serde(deserialize_with = "lenient_id")]
    pub user_id: String,
    #[serde(default)]
    pub data: Value,
}

impl DataFrame {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.cluster_id.clone(), self.user_id.clone())
    }
}

/// Ids arrive as strings from some servers and bare numbers from others.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Parse one inbound text frame. Only DATA frames are meaningful to the
/// client; anything else is reported so the caller can log and drop it.
pub fn parse_server_frame(text: &str) -> Result<DataFrame, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e, text))?;
    match value.get("type").and_then(Value::as_str) {
        Some("DATA") => {
            serde_json::from_value(value).map_err(|e| ProtocolError::malformed(e, text))
        }
        Some(other) => Err(ProtocolError::UnknownType(other.to_string())),
        None => Err(ProtocolError::malformed("missing frame type", text)),
    }
}
