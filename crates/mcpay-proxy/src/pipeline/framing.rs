//! JSON-RPC framing guard.
//!
//! Payloads that carry nothing for the upstream to act on (responses,
//! notifications) are acknowledged with 202 before they can consume rate
//! limit or payment budget.

use serde_json::Value;

use crate::pipeline::context::{CacheStatus, RequestContext};

/// Shape of a single JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Has `method` and a non-null `id`.
    Request { method: String },
    /// Has `method` but no `id`.
    Notification { method: String },
    /// No `method`: a `result`/`error` reply to an earlier request.
    Response,
    /// Not a JSON object.
    Unclassifiable,
}

impl MessageKind {
    pub fn is_actionable(&self) -> bool {
        matches!(self, MessageKind::Request { .. } | MessageKind::Unclassifiable)
    }
}

pub fn classify_message(value: &Value) -> MessageKind {
    let Some(obj) = value.as_object() else {
        return MessageKind::Unclassifiable;
    };
    let has_id = obj.get("id").map(|id| !id.is_null()).unwrap_or(false);
    match obj.get("method").and_then(|m| m.as_str()) {
        Some(method) if has_id => MessageKind::Request {
            method: method.to_string(),
        },
        Some(method) => MessageKind::Notification {
            method: method.to_string(),
        },
        None => MessageKind::Response,
    }
}

/// True when the body is a message or non-empty batch with no request in it.
pub fn is_non_actionable(body: &Value) -> bool {
    match body {
        Value::Array(batch) => {
            !batch.is_empty() && batch.iter().all(|m| !classify_message(m).is_actionable())
        }
        other => !classify_message(other).is_actionable(),
    }
}

/// Returns true when the request must be answered with 202 and no body.
/// Also marks event-stream GETs as cache bypass.
pub fn inspect_framing(ctx: &mut RequestContext) -> bool {
    if ctx.request.method == "GET" && ctx.request.wants_event_stream() {
        ctx.cache_status = CacheStatus::Bypass;
    }
    if ctx.request.method != "POST" {
        return false;
    }
    match ctx.request.json_body() {
        Some(body) => is_non_actionable(&body),
        None => false,
    }
}
