//! Outbound header preparation.

use mcpay::WALLET_ADDRESS_HEADER;

use crate::pipeline::context::{HeaderList, InboundRequest};

/// Headers never forwarded upstream: hop-by-hop, client credentials,
/// payment material and proxy-chain metadata.
const HEADERS_TO_STRIP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "proxy-authorization",
    "proxy-authenticate",
    "proxy-connection",
    "authorization",
    "cookie",
    "x-api-key",
    "x-payment",
    "x-wallet-address",
    "x-wallet-provider",
    "x-wallet-type",
    "forwarded",
    "via",
    "x-real-ip",
];

const STRIPPED_PREFIXES: &[&str] = &["x-forwarded-", "cf-"];

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const DEFAULT_ACCEPT: &str = "application/json, text/event-stream";

fn is_stripped(name: &str) -> bool {
    HEADERS_TO_STRIP.contains(&name) || STRIPPED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Filter the inbound headers and inject the caller's wallet address.
pub fn prepare_headers(request: &InboundRequest, wallet_address: Option<&str>) -> HeaderList {
    let mut headers: HeaderList = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .filter(|(name, _)| !is_stripped(name))
        .collect();

    if !headers.iter().any(|(name, _)| name == "user-agent") {
        headers.push(("user-agent".to_string(), DEFAULT_USER_AGENT.to_string()));
    }
    if !headers.iter().any(|(name, _)| name == "accept") {
        headers.push(("accept".to_string(), DEFAULT_ACCEPT.to_string()));
    }
    if let Some(wallet) = wallet_address {
        headers.push((WALLET_ADDRESS_HEADER.to_ascii_lowercase(), wallet.to_string()));
    }
    headers
}
