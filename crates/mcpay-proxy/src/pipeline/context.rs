use bytes::Bytes;
use serde_json::Value;
use url::Url;

use crate::pipeline::payment::PaymentState;
use crate::store::{PricingEntry, ServerRecord};

/// Header list with lowercase names, in arrival order.
pub type HeaderList = Vec<(String, String)>;

/// Case-insensitive lookup of the first header named `name`.
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// The inbound request exactly as received, before any step touched it.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Uppercase HTTP method.
    pub method: String,
    /// Full local path, including the `/proxy/{serverId}` prefix.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    pub headers: HeaderList,
    pub body: Bytes,
    pub client_ip: Option<String>,
}

impl InboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// First value of a query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Body parsed as JSON, if it is JSON.
    pub fn json_body(&self) -> Option<Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    pub fn wants_event_stream(&self) -> bool {
        self.header("accept")
            .map(|a| a.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false)
    }
}

/// Where a response came from. Gateway responses are produced by the proxy
/// itself (challenges, 202s, errors) and never reached the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Upstream,
    Cache,
    Gateway,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl ProxyResponse {
    pub fn gateway(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
            source: ResponseSource::Gateway,
        }
    }

    pub fn gateway_json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
            source: ResponseSource::Gateway,
        }
    }

    /// Error body in the same `{error, message}` shape as [`crate::error::ProxyError`].
    pub fn error(status: u16, error: &str, message: impl Into<String>) -> Self {
        Self::gateway_json(
            status,
            &serde_json::json!({ "error": error, "message": message.into() }),
        )
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replace any existing value of `name`.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_ascii_lowercase(), value.into()));
    }

    pub fn is_event_stream(&self) -> bool {
        self.header("content-type")
            .map(|ct| ct.to_ascii_lowercase().starts_with("text/event-stream"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    ApiKey,
    Session,
    WalletHeader,
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub wallet_address: Option<String>,
    pub method: AuthMethod,
    /// Caller sent `x-wallet-provider` or `x-wallet-type`.
    pub managed_wallet_hint: bool,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            wallet_address: None,
            method: AuthMethod::Anonymous,
            managed_wallet_hint: false,
        }
    }

    /// Callers the proxy may sign for: API-key holders, and wallet-header
    /// callers that declare a managed wallet.
    pub fn auto_sign_eligible(&self) -> bool {
        self.user_id.is_some()
            && match self.method {
                AuthMethod::ApiKey => true,
                AuthMethod::WalletHeader => self.managed_wallet_hint,
                AuthMethod::Session | AuthMethod::Anonymous => false,
            }
    }
}

/// A classified `tools/call` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Option<Value>,
    pub description: Option<String>,
    pub server_id: String,
    /// None when the tool is not in the server's catalog.
    pub tool_id: Option<String>,
    pub pay_to: Option<String>,
    /// Active pricing entries in catalog order.
    pub pricing_candidates: Vec<PricingEntry>,
}

impl ToolCall {
    pub fn is_paid(&self) -> bool {
        !self.pricing_candidates.is_empty()
    }

    /// `mcpay://{serverId}/tools/{name}`
    pub fn resource(&self) -> String {
        format!("mcpay://{}/tools/{}", self.server_id, self.name)
    }
}

/// Per-request state threaded through every pipeline step.
#[derive(Debug)]
pub struct RequestContext {
    pub request: InboundRequest,
    pub request_id: String,
    pub started_at_ms: u64,
    pub identity: Identity,
    pub server: Option<ServerRecord>,
    pub tool_call: Option<ToolCall>,
    /// The pricing entry chosen for this call.
    pub pricing: Option<PricingEntry>,
    pub upstream_url: Option<Url>,
    pub outbound_headers: HeaderList,
    /// Buffered outbound body, resent verbatim on every retry.
    pub body: Bytes,
    pub cache_key: Option<String>,
    pub cache_status: CacheStatus,
    pub payment: PaymentState,
    pub response: Option<ProxyResponse>,
}

impl RequestContext {
    pub fn new(request: InboundRequest, request_id: String, started_at_ms: u64) -> Self {
        let cache_status = if request.method == "GET" {
            CacheStatus::Miss
        } else {
            CacheStatus::Bypass
        };
        Self {
            request,
            request_id,
            started_at_ms,
            identity: Identity::anonymous(),
            server: None,
            tool_call: None,
            pricing: None,
            upstream_url: None,
            outbound_headers: Vec::new(),
            body: Bytes::new(),
            cache_key: None,
            cache_status,
            payment: PaymentState::Unpriced,
            response: None,
        }
    }

    pub fn upstream_host(&self) -> Option<&str> {
        self.upstream_url.as_ref().and_then(|u| u.host_str())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn request(method: &str, path: &str) -> InboundRequest {
        InboundRequest {
            method: method.to_string(),
            path: path.to_string(),
            query: None,
            headers: Vec::new(),
            body: Bytes::new(),
            client_ip: None,
        }
    }

    pub fn json_request(path: &str, body: &Value) -> InboundRequest {
        InboundRequest {
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
            ..request("POST", path)
        }
    }
}
