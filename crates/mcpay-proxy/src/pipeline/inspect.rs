//! Tool-call inspection: which server, which tool, what it costs.

use serde_json::Value;

use crate::pipeline::context::{RequestContext, ToolCall};
use crate::pipeline::Collaborators;
use crate::store::{PricingEntry, ServerRecord, ToolRecord};

const PROXY_PREFIX: &str = "/proxy/";
const TOOLS_CALL: &str = "tools/call";

/// Outcome of inspecting a request.
#[derive(Debug, PartialEq)]
pub enum Inspection {
    Proceed,
    /// A batch invokes more than one tool; each call must be paid separately.
    MultipleToolCalls,
}

/// Split `/proxy/{serverId}/{rest}` into the server id and the remainder
/// (without its leading slash).
pub fn split_proxy_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix(PROXY_PREFIX)?;
    let (server_id, remainder) = match rest.split_once('/') {
        Some((id, remainder)) => (id, remainder),
        None => (rest, ""),
    };
    (!server_id.is_empty()).then_some((server_id, remainder))
}

fn tool_call_parts(message: &Value) -> Option<(String, Option<Value>)> {
    if message.get("method").and_then(|m| m.as_str()) != Some(TOOLS_CALL) {
        return None;
    }
    let params = message.get("params")?;
    let name = params.get("name")?.as_str()?.to_string();
    let arguments = params.get("arguments").cloned();
    Some((name, arguments))
}

/// `tools/call` invocations in a body, single or batched.
pub fn extract_tool_calls(body: &Value) -> Vec<(String, Option<Value>)> {
    match body {
        Value::Array(batch) => batch.iter().filter_map(tool_call_parts).collect(),
        single => tool_call_parts(single).into_iter().collect(),
    }
}

pub fn active_pricing(tool: &ToolRecord) -> Vec<PricingEntry> {
    tool.pricing.iter().filter(|p| p.active).cloned().collect()
}

/// The entry on `default_network` if any, otherwise the first in catalog order.
pub fn select_pricing<'a>(
    candidates: &'a [PricingEntry],
    default_network: &str,
) -> Option<&'a PricingEntry> {
    candidates
        .iter()
        .find(|p| p.network == default_network)
        .or_else(|| candidates.first())
}

pub fn classify_tool_call(
    server: &ServerRecord,
    tools: &[ToolRecord],
    name: String,
    arguments: Option<Value>,
) -> ToolCall {
    let tool = tools.iter().find(|t| t.name == name);
    ToolCall {
        tool_id: tool.map(|t| t.id.clone()),
        description: tool.and_then(|t| t.description.clone()),
        pricing_candidates: tool.map(active_pricing).unwrap_or_default(),
        pay_to: Some(server.receiver_address.clone()).filter(|a| !a.is_empty()),
        server_id: server.id.clone(),
        name,
        arguments,
    }
}

/// Resolve server, tool and pricing into the context. Lookup failures leave
/// the request unclassified.
pub async fn inspect(
    ctx: &mut RequestContext,
    deps: &Collaborators,
    default_network: &str,
) -> Inspection {
    let Some((server_id, _)) = split_proxy_path(&ctx.request.path) else {
        return Inspection::Proceed;
    };
    let server_id = server_id.to_string();

    let server = match deps.catalog.lookup_server_by_id(&server_id).await {
        Ok(Some(server)) => server,
        Ok(None) => {
            tracing::debug!(server_id = %server_id, "unknown server");
            return Inspection::Proceed;
        }
        Err(e) => {
            tracing::warn!(server_id = %server_id, error = %e, "server lookup failed");
            return Inspection::Proceed;
        }
    };
    ctx.server = Some(server.clone());

    if ctx.request.method != "POST" {
        return Inspection::Proceed;
    }
    let Some(body) = ctx.request.json_body() else {
        return Inspection::Proceed;
    };
    let mut calls = extract_tool_calls(&body);
    if calls.len() > 1 {
        return Inspection::MultipleToolCalls;
    }
    let Some((name, arguments)) = calls.pop() else {
        return Inspection::Proceed;
    };

    let tools = match deps.catalog.list_tools(&server.id).await {
        Ok(tools) => tools,
        Err(e) => {
            tracing::warn!(server_id = %server.id, error = %e, "tool catalog lookup failed");
            Vec::new()
        }
    };

    let call = classify_tool_call(&server, &tools, name, arguments);
    ctx.pricing = select_pricing(&call.pricing_candidates, default_network).cloned();
    tracing::debug!(
        server_id = %server.id,
        tool = %call.name,
        paid = call.is_paid(),
        "classified tool call"
    );
    ctx.tool_call = Some(call);
    Inspection::Proceed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::test_support::json_request;
    use crate::pipeline::fakes::{collaborators, seeded_db, SERVER_ID};
    use serde_json::json;

    fn entry(network: &str, active: bool) -> PricingEntry {
        PricingEntry {
            network: network.to_string(),
            asset_address: "0xasset".to_string(),
            max_amount_required_raw: "100".to_string(),
            token_decimals: 6,
            active,
        }
    }

    #[test]
    fn test_split_proxy_path() {
        assert_eq!(split_proxy_path("/proxy/abc"), Some(("abc", "")));
        assert_eq!(split_proxy_path("/proxy/abc/mcp/v1"), Some(("abc", "mcp/v1")));
        assert_eq!(split_proxy_path("/proxy/"), None);
        assert_eq!(split_proxy_path("/other/abc"), None);
    }

    #[test]
    fn test_select_pricing_prefers_default_network() {
        let candidates = vec![entry("base", true), entry("base-sepolia", true)];
        assert_eq!(
            select_pricing(&candidates, "base-sepolia").unwrap().network,
            "base-sepolia"
        );
        assert_eq!(select_pricing(&candidates, "solana").unwrap().network, "base");
        assert!(select_pricing(&[], "base").is_none());
    }

    #[test]
    fn test_inactive_pricing_means_unpaid() {
        let server = ServerRecord {
            id: "s".to_string(),
            origin_url: "https://u.example".to_string(),
            receiver_address: "0xpay".to_string(),
            name: None,
        };
        let tools = vec![ToolRecord {
            id: "t".to_string(),
            server_id: "s".to_string(),
            name: "free".to_string(),
            description: None,
            pricing: vec![entry("base", false)],
        }];
        let call = classify_tool_call(&server, &tools, "free".to_string(), None);
        assert!(!call.is_paid());
        assert_eq!(call.tool_id.as_deref(), Some("t"));

        let unknown = classify_tool_call(&server, &tools, "missing".to_string(), None);
        assert!(unknown.tool_id.is_none());
        assert!(!unknown.is_paid());
    }

    #[tokio::test]
    async fn test_inspect_paid_tool_call() {
        let deps = collaborators(seeded_db());
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "search", "arguments": {"q": "rust"}}
        });
        let mut ctx = RequestContext::new(
            json_request(&format!("/proxy/{SERVER_ID}/mcp"), &body),
            "r".into(),
            0,
        );

        assert_eq!(inspect(&mut ctx, &deps, "base-sepolia").await, Inspection::Proceed);
        let call = ctx.tool_call.as_ref().unwrap();
        assert!(call.is_paid());
        assert_eq!(call.arguments, Some(json!({"q": "rust"})));
        assert_eq!(ctx.pricing.as_ref().unwrap().network, "base-sepolia");
        assert_eq!(call.resource(), format!("mcpay://{SERVER_ID}/tools/search"));
    }

    #[tokio::test]
    async fn test_inspect_swallows_unknown_server_and_bad_json() {
        let deps = collaborators(seeded_db());
        let mut ctx = RequestContext::new(
            json_request("/proxy/nope/mcp", &json!({"method": "tools/call"})),
            "r".into(),
            0,
        );
        assert_eq!(inspect(&mut ctx, &deps, "base").await, Inspection::Proceed);
        assert!(ctx.server.is_none());
        assert!(ctx.tool_call.is_none());

        let mut req = json_request(&format!("/proxy/{SERVER_ID}"), &json!({}));
        req.body = bytes::Bytes::from_static(b"{not json");
        let mut ctx = RequestContext::new(req, "r".into(), 0);
        assert_eq!(inspect(&mut ctx, &deps, "base").await, Inspection::Proceed);
        assert!(ctx.server.is_some());
        assert!(ctx.tool_call.is_none());
    }

    #[tokio::test]
    async fn test_batched_tool_calls_are_rejected() {
        let deps = collaborators(seeded_db());
        let call = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "search"}});
        let mut ctx = RequestContext::new(
            json_request(&format!("/proxy/{SERVER_ID}"), &json!([call.clone(), call])),
            "r".into(),
            0,
        );
        assert_eq!(
            inspect(&mut ctx, &deps, "base").await,
            Inspection::MultipleToolCalls
        );
    }
}
