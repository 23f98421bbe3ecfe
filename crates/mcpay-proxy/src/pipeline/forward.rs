//! Destination rewriting and outbound request buffering.

use bytes::Bytes;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::ProxyError;
use crate::pipeline::context::RequestContext;
use crate::pipeline::inspect::split_proxy_path;

/// Query parameters and top-level body fields that carry proxy credentials
/// and are never forwarded.
const CREDENTIAL_PARAMS: &[&str] = &["api_key", "apiKey"];

/// Sanitize a query string to prevent CRLF injection and fragment smuggling.
pub fn sanitize_query(query: &str) -> Result<String, ProxyError> {
    if query.contains('\r') || query.contains('\n') {
        return Err(ProxyError::BadRequest(
            "query string must not contain newlines".to_string(),
        ));
    }

    // Fragments are client-side only
    let sanitized = match query.find('#') {
        Some(idx) => &query[..idx],
        None => query,
    };

    if sanitized.contains('\0') {
        return Err(ProxyError::BadRequest(
            "query string must not contain null bytes".to_string(),
        ));
    }

    Ok(sanitized.to_string())
}

/// Validate the path remainder against its decoded form, returning it still encoded
/// so `%3F` and friends cannot turn into URL syntax.
pub fn sanitize_path(path: &str) -> Result<String, ProxyError> {
    let decoded = urlencoding::decode(path)
        .map_err(|_| ProxyError::BadRequest("invalid URL encoding in path".to_string()))?;

    if decoded.contains("..") {
        return Err(ProxyError::BadRequest("path traversal not allowed".to_string()));
    }
    // `//host` would replace the authority
    if decoded.starts_with('/') {
        return Err(ProxyError::BadRequest("path must not start with /".to_string()));
    }
    if decoded.contains('@') {
        return Err(ProxyError::BadRequest("path must not contain @".to_string()));
    }
    if decoded.contains('\r') || decoded.contains('\n') {
        return Err(ProxyError::BadRequest("path must not contain newlines".to_string()));
    }
    if decoded.contains('\0') {
        return Err(ProxyError::BadRequest("path must not contain null bytes".to_string()));
    }

    Ok(path.to_string())
}

/// Join the upstream origin with the local remainder and merge query strings.
/// Parameters declared on the origin URL win over inbound ones.
pub fn build_upstream_url(
    origin_url: &str,
    remainder: &str,
    inbound_query: Option<&str>,
) -> Result<Url, ProxyError> {
    let mut url = Url::parse(origin_url)
        .map_err(|e| ProxyError::Upstream(format!("invalid origin URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::Upstream(format!(
            "unsupported origin scheme: {}",
            url.scheme()
        )));
    }

    if !remainder.is_empty() {
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/{remainder}"));
    }

    let upstream_pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let inbound_pairs: Vec<(String, String)> = inbound_query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .filter(|(k, _)| !CREDENTIAL_PARAMS.contains(&k.as_str()))
                .filter(|(k, _)| !upstream_pairs.iter().any(|(uk, _)| uk == k))
                .collect()
        })
        .unwrap_or_default();

    if upstream_pairs.is_empty() && inbound_pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut()
            .clear()
            .extend_pairs(inbound_pairs.iter().chain(upstream_pairs.iter()));
    }
    url.set_fragment(None);
    Ok(url)
}

/// Drop top-level credential fields from a JSON object body. Any other body is
/// forwarded byte for byte.
pub fn strip_body_credentials(body: &Bytes) -> Bytes {
    let Ok(Value::Object(mut fields)) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    if !CREDENTIAL_PARAMS.iter().any(|k| fields.contains_key(*k)) {
        return body.clone();
    }
    for key in CREDENTIAL_PARAMS {
        fields.remove(*key);
    }
    match serde_json::to_vec(&Value::Object(fields)) {
        Ok(stripped) => Bytes::from(stripped),
        Err(_) => body.clone(),
    }
}

/// sha256(method, final URL, body), hex encoded.
pub fn cache_key(method: &str, url: &Url, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// Rewrite the destination, buffer the body and compute the cache key.
pub fn forward(ctx: &mut RequestContext) -> Result<(), ProxyError> {
    let Some(server) = ctx.server.as_ref() else {
        let server_id = split_proxy_path(&ctx.request.path)
            .map(|(id, _)| id.to_string())
            .unwrap_or_default();
        return Err(ProxyError::ServerNotFound(server_id));
    };

    let remainder = split_proxy_path(&ctx.request.path)
        .map(|(_, rest)| rest)
        .unwrap_or("");
    let remainder = sanitize_path(remainder)?;
    let query = ctx
        .request
        .query
        .as_deref()
        .filter(|q| !q.is_empty())
        .map(sanitize_query)
        .transpose()?;

    let url = build_upstream_url(&server.origin_url, &remainder, query.as_deref())?;
    ctx.body = strip_body_credentials(&ctx.request.body);
    ctx.cache_key = Some(cache_key(&ctx.request.method, &url, &ctx.body));
    ctx.upstream_url = Some(url);
    Ok(())
}
