use crate::pipeline::context::{RequestContext, ResponseSource};
use crate::pipeline::Collaborators;
use crate::store::UsageRecord;

/// Build the usage record for a served tool call. Proxy-generated responses
/// (challenges, 202s, errors) and calls to uncatalogued tools are not recorded.
pub fn usage_record(ctx: &RequestContext, latency_ms: u64) -> Option<UsageRecord> {
    let tool = ctx.tool_call.as_ref()?;
    let tool_id = tool.tool_id.clone()?;
    let response = ctx.response.as_ref()?;
    if response.source == ResponseSource::Gateway {
        return None;
    }

    let result = if response.is_event_stream() {
        None
    } else {
        serde_json::from_slice(&response.body).ok()
    };

    Some(UsageRecord {
        tool_id,
        server_id: tool.server_id.clone(),
        user_id: ctx.identity.user_id.clone(),
        status: response.status,
        latency_ms,
        ip_address: ctx.request.client_ip.clone(),
        user_agent: ctx.request.header("user-agent").map(str::to_string),
        arguments: tool.arguments.clone(),
        result,
    })
}

/// Best-effort: failures are logged and never reach the client.
pub async fn record(ctx: &RequestContext, deps: &Collaborators, latency_ms: u64) {
    let Some(usage) = usage_record(ctx, latency_ms) else {
        return;
    };
    if let Err(e) = deps.usage.record(&usage).await {
        tracing::warn!(tool_id = %usage.tool_id, error = %e, "failed to record usage");
    }
}
