//! Caller identity resolution.
//!
//! First match wins: API key, then session token, then the wallet-address
//! header, then anonymous. Collaborator failures are logged and fall through
//! to the next branch.

use mcpay::security::sha256_hex;
use mcpay::{WalletChain, WALLET_ADDRESS_HEADER, WALLET_PROVIDER_HEADER, WALLET_TYPE_HEADER};

use crate::pipeline::context::{AuthMethod, Identity, InboundRequest};
use crate::pipeline::Collaborators;

const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_PARAMS: &[&str] = &["api_key", "apiKey"];
const SESSION_COOKIE: &str = "session_token";

pub async fn resolve_identity(request: &InboundRequest, deps: &Collaborators) -> Identity {
    let managed_wallet_hint =
        request.header(WALLET_PROVIDER_HEADER).is_some() || request.header(WALLET_TYPE_HEADER).is_some();

    if let Some(identity) = from_api_key(request, deps).await {
        return Identity {
            managed_wallet_hint,
            ..identity
        };
    }
    if let Some(identity) = from_session(request, deps).await {
        return Identity {
            managed_wallet_hint,
            ..identity
        };
    }
    if let Some(identity) = from_wallet_header(request, deps).await {
        return Identity {
            managed_wallet_hint,
            ..identity
        };
    }
    Identity {
        managed_wallet_hint,
        ..Identity::anonymous()
    }
}

/// API key from header, query string, or top-level JSON body field.
fn api_key(request: &InboundRequest) -> Option<String> {
    if let Some(key) = request.header(API_KEY_HEADER) {
        return Some(key.trim().to_string());
    }
    for name in API_KEY_PARAMS {
        if let Some(key) = request.query_param(name) {
            return Some(key);
        }
    }
    let body = request.json_body()?;
    API_KEY_PARAMS
        .iter()
        .find_map(|name| body.get(*name).and_then(|v| v.as_str()))
        .map(str::to_string)
}

fn session_token(request: &InboundRequest) -> Option<String> {
    if let Some(token) = request
        .header("authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }
    request.header("cookie").and_then(|cookies| {
        cookies.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_string())
        })
    })
}

async fn from_api_key(request: &InboundRequest, deps: &Collaborators) -> Option<Identity> {
    let key = api_key(request).filter(|k| !k.is_empty())?;
    let key_hash = sha256_hex(key.as_bytes());

    let user = match deps.identities.validate_api_key(&key_hash).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::debug!("unknown or inactive API key");
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "API key lookup failed");
            return None;
        }
    };

    let wallet_address = primary_wallet(deps, &user.id).await;
    Some(Identity {
        user_id: Some(user.id),
        wallet_address,
        method: AuthMethod::ApiKey,
        managed_wallet_hint: false,
    })
}

async fn from_session(request: &InboundRequest, deps: &Collaborators) -> Option<Identity> {
    let token = session_token(request).filter(|t| !t.is_empty())?;

    let user = match deps.sessions.validate(&token).await {
        Ok(Some(user)) => user,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(error = %e, "session validation failed");
            return None;
        }
    };

    let wallet_address = primary_wallet(deps, &user.user_id).await;
    Some(Identity {
        user_id: Some(user.user_id),
        wallet_address,
        method: AuthMethod::Session,
        managed_wallet_hint: false,
    })
}

async fn from_wallet_header(request: &InboundRequest, deps: &Collaborators) -> Option<Identity> {
    let address = request.header(WALLET_ADDRESS_HEADER)?.trim();
    let Some(chain) = WalletChain::guess(address) else {
        tracing::debug!(address = %address, "unrecognized wallet address shape");
        return None;
    };

    match deps
        .identities
        .get_or_create_user_by_wallet(address, chain)
        .await
    {
        Ok(user) => Some(Identity {
            wallet_address: user
                .wallet_address
                .or_else(|| Some(address.to_string())),
            user_id: Some(user.id),
            method: AuthMethod::WalletHeader,
            managed_wallet_hint: false,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "wallet user lookup failed");
            None
        }
    }
}

async fn primary_wallet(deps: &Collaborators, user_id: &str) -> Option<String> {
    deps.identities
        .primary_wallet(user_id)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(user_id = %user_id, error = %e, "primary wallet lookup failed");
            None
        })
}
