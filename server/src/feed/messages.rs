use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::HubError;
use crate::types::HubResult;

/// Correlation id carried by inbound delta frames.
pub const DELTA_RID: &str = "0";

pub mod commands {
    pub const REQUEST_SESSION: &str = "request_session";
    pub const GET: &str = "get";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
}

pub const SOURCE_BETTING: &str = "betting";

/// Outbound correlated frame. `rid` is a decimal string; `"0"` is reserved
/// for upstream deltas and never issued by us.
#[derive(Debug, Clone, Serialize)]
pub struct FeedRequest {
    pub command: String,
    pub params: Value,
    pub rid: String,
}

impl FeedRequest {
    pub fn new(command: &str, params: Value, rid: u64) -> Self {
        FeedRequest {
            command: command.to_string(),
            params,
            rid: rid.to_string(),
        }
    }
}

/// Inbound frame. Replies echo the request `rid`; delta pushes use
/// [`DELTA_RID`]. A non-zero `code` is a rejected request.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedFrame {
    #[serde(default, deserialize_with = "lenient_rid")]
    pub rid: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl FeedFrame {
    pub fn decode(text: &str) -> HubResult<FeedFrame> {
        serde_json::from_str(text)
            .map_err(|e| HubError::ParseError(format!("undecodable feed frame: {e}")))
    }

    pub fn is_delta(&self) -> bool {
        self.rid.as_deref() == Some(DELTA_RID)
    }

    pub fn reply_rid(&self) -> Option<u64> {
        self.rid.as_deref().and_then(|rid| rid.parse().ok())
    }
}

/// The feed emits `rid` as either a string or a number depending on the
/// producing subsystem.
fn lenient_rid<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

pub fn session_params(site_id: u64, language: &str) -> Value {
    serde_json::json!({
        "site_id": site_id,
        "language": language,
    })
}

/// Extracts the session token from a `request_session` reply.
pub fn parse_session_reply(reply: &Value) -> HubResult<String> {
    let sid = reply
        .get("sid")
        .or_else(|| reply.pointer("/data/sid"))
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::ConnectFailed("handshake reply had no sid".into()))?;
    if sid.is_empty() {
        return Err(HubError::Fatal("handshake returned an empty session id".into()));
    }
    Ok(sid.to_string())
}

/// Extracts `(subid, initial document)` from a subscribe reply.
pub fn parse_subscribe_reply(reply: &Value) -> HubResult<(String, Value)> {
    let subid = match reply.get("subid") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(HubError::SubscribeFailed(
                "subscribe reply had no subid".into(),
            ));
        }
    };
    let initial = reply.get("data").cloned().unwrap_or(Value::Object(Default::default()));
    Ok((subid, initial))
}
