//! Wire protocol types for the computation worker.
//!
//! One JSON object per line over the worker's stdin/stdout:
//! - **request** (parent → worker): `{"msgId": ..., "code": ...}`
//! - **response** (worker → parent): `{"msgId": ..., "error": bool, "result": ...}`

use serde::{Deserialize, Serialize};

/// Correlation id carried by a request and its response.
///
/// Opaque to the worker, which echoes it back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(String);

impl MsgId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Code execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(rename = "msgId")]
    pub msg_id: MsgId,
    pub code: String,
}

/// Worker reply to a [`WorkerRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    #[serde(rename = "msgId")]
    pub msg_id: MsgId,
    #[serde(default)]
    pub error: bool,
    /// Variable bindings on success, error description on failure.
    #[serde(default)]
    pub result: serde_json::Value,
}

impl WorkerResponse {
    /// Human-readable form of `result`, used when `error` is set.
    pub fn error_message(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => "worker reported an error".to_string(),
            other => other.to_string(),
        }
    }
}
