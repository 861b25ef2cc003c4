//! Line-delimited JSON command protocol
//!
//! Requests are `{"method": "...", "params": {...}}` followed by `\n`.
//! Replies are a single line holding either `{"result": ...}` or `{"error": ...}`.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{Error, Result};

/// A method call sent to the device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    /// Method name understood by the firmware
    pub method: String,

    /// Optional named parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl Command {
    /// Command without parameters
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
        }
    }

    /// Command with a parameter object
    ///
    /// Non-object values are wrapped as `{"value": ...}`.
    #[must_use]
    pub fn with_params(method: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => return Self::new(method),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Self {
            method: method.into(),
            params: Some(params),
        }
    }

    /// Serialize to one newline-terminated frame
    ///
    /// # Errors
    ///
    /// Returns error if the method name is empty or contains a line break
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.method.is_empty() || self.method.contains(['\n', '\r']) {
            return Err(Error::Protocol(format!(
                "invalid method name: {:?}",
                self.method
            )));
        }

        // serde_json escapes control characters, so the body is always one line
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }
}

/// Parse one reply line into the method result
///
/// # Errors
///
/// - `Error::Protocol` if the line is empty, not JSON, or has neither field
/// - `Error::Remote` if the peer returned an error field
pub fn decode_reply(line: &str) -> Result<Value> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::Protocol("empty reply".to_string()));
    }

    let mut reply: Map<String, Value> = serde_json::from_str(line)
        .map_err(|e| Error::Protocol(format!("malformed reply {line:?}: {e}")))?;

    if let Some(error) = reply.remove("error").filter(|e| !e.is_null()) {
        return Err(Error::Remote(remote_message(&error)));
    }

    reply
        .remove("result")
        .ok_or_else(|| Error::Protocol(format!("reply has no result: {line:?}")))
}

fn remote_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), ToString::to_string),
        other => other.to_string(),
    }
}
