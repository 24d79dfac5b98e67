use crate::error::ErrorPayload;
use crate::types::{FunctionCallArgs, PromptParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Everything that crosses a port, as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeMessage {
    Request { id: Uuid, request: BridgeRequest },
    Response { id: Uuid, result: Result<Value, ErrorPayload> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "args", rename_all = "camelCase")]
pub enum BridgeRequest {
    FunctionCall(FunctionCallArgs),
    PreloadPlugins(Vec<String>),
    /// Interface description of one plugin.
    GetJson(String),
    OpenPrompt(PromptParams),
}

/// Id of a request that failed to decode, when one can still be read.
pub(crate) fn recover_request_id(data: &str) -> Option<Uuid> {
    let value: Value = serde_json::from_str(data).ok()?;
    if value.get("type")?.as_str()? != "request" {
        return None;
    }
    value.get("id")?.as_str()?.parse().ok()
}
