//! Event translation
//!
//! Parses a verified webhook body into a `ProvisionRequest`. Only
//! `EVENT_START` and `EVENT_END` are acted on; other `EVENT_*` types are
//! recognised and reported as unsupported so the caller can acknowledge them
//! without retrying.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Lifecycle direction requested by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Start,
    End,
}

impl EventType {
    /// Wire name of the event type
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Start => "EVENT_START",
            EventType::End => "EVENT_END",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised inbound intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub event_type: EventType,
    pub resource_name: String,
    pub event_id: String,
    /// Source-side resource kind; only `Server` is provisioned
    pub resource_type: Option<String>,
    /// Auxiliary values (image, checksums, ...) with non-string values stringified
    pub metadata: BTreeMap<String, String>,
    pub ssh_public_key: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub webhook_id: Option<String>,
}

impl ProvisionRequest {
    /// Requested image, if any
    pub fn image(&self) -> Option<&str> {
        self.metadata_value("image")
    }

    /// Non-empty metadata value for `key`
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Whether the event targets a physical server
    pub fn is_server(&self) -> bool {
        self.resource_type
            .as_deref()
            .is_none_or(|t| t.eq_ignore_ascii_case("server"))
    }
}

/// Reasons a payload cannot be turned into a `ProvisionRequest`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// Not JSON, a required field is missing, or the event type is unknown
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Recognised `EVENT_*` type that this webhook does not act on
    #[error("Unsupported event type: {0}")]
    Unsupported(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    event_type: Option<String>,
    resource_name: Option<String>,
    event_id: Option<Value>,
    resource_type: Option<String>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, Value>>,
    ssh_public_key: Option<String>,
    user_id: Option<Value>,
    username: Option<String>,
    webhook_id: Option<Value>,
}

/// Renders a scalar id as a string; objects, arrays and empty strings are rejected.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parses a raw webhook body.
pub fn translate(body: &[u8]) -> Result<ProvisionRequest, TranslateError> {
    let raw: RawEvent = serde_json::from_slice(body)
        .map_err(|e| TranslateError::Malformed(format!("invalid JSON: {}", e)))?;

    let event_type = non_empty(raw.event_type)
        .ok_or_else(|| TranslateError::Malformed("missing eventType".to_string()))?;
    let event_type = match event_type.as_str() {
        "EVENT_START" => EventType::Start,
        "EVENT_END" => EventType::End,
        other if other.starts_with("EVENT_") => {
            return Err(TranslateError::Unsupported(other.to_string()));
        }
        other => {
            return Err(TranslateError::Malformed(format!("unknown eventType '{}'", other)));
        }
    };

    let resource_name = non_empty(raw.resource_name)
        .ok_or_else(|| TranslateError::Malformed("missing resourceName".to_string()))?;
    let event_id = raw
        .event_id
        .as_ref()
        .and_then(scalar_to_string)
        .ok_or_else(|| TranslateError::Malformed("missing eventId".to_string()))?;

    let metadata: BTreeMap<String, String> = raw
        .metadata
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| scalar_to_string(&v).map(|v| (k, v)))
        .collect();

    let ssh_public_key =
        non_empty(raw.ssh_public_key).or_else(|| metadata.get("sshPublicKey").cloned());

    Ok(ProvisionRequest {
        event_type,
        resource_name,
        event_id,
        resource_type: non_empty(raw.resource_type),
        metadata,
        ssh_public_key,
        user_id: raw.user_id.as_ref().and_then(scalar_to_string),
        username: non_empty(raw.username),
        webhook_id: raw.webhook_id.as_ref().and_then(scalar_to_string),
    })
}
