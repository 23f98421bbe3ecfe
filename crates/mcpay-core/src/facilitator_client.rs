//! HTTP client for a remote x402 facilitator's `/verify` and `/settle` endpoints.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::constants::{FACILITATOR_AUTH_HEADER, X402_VERSION};
use crate::error::McpayError;
use crate::payment::{PaymentPayload, PaymentRequirements};
use crate::response::{SettleResponse, VerifyResponse};
use crate::scheme::{PaymentSettler, PaymentVerifier};

const FACILITATOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Talks to a facilitator over HTTP. Request bodies are signed with
/// HMAC-SHA256 when a shared secret is configured.
#[derive(Clone)]
pub struct FacilitatorClient {
    http: reqwest::Client,
    base_url: String,
    hmac_secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for FacilitatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorClient")
            .field("base_url", &self.base_url)
            .field(
                "hmac_secret",
                &self.hmac_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl FacilitatorClient {
    pub fn new(http: reqwest::Client, base_url: &str, hmac_secret: Option<Vec<u8>>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            hmac_secret,
        }
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<T, McpayError> {
        let url = format!("{}/{}", self.base_url, path);
        let body = serde_json::json!({
            "x402Version": X402_VERSION,
            "paymentPayload": payload,
            "paymentRequirements": requirements,
        });
        let body_bytes = serde_json::to_vec(&body)?;

        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(FACILITATOR_TIMEOUT);

        if let Some(ref secret) = self.hmac_secret {
            let sig = crate::hmac::compute_hmac(secret, &body_bytes);
            request = request.header(FACILITATOR_AUTH_HEADER, sig);
        }

        let resp = request
            .body(body_bytes)
            .send()
            .await
            .map_err(|e| McpayError::Facilitator(format!("{path} request failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(McpayError::Facilitator(
                "facilitator authentication failed".to_string(),
            ));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| McpayError::Facilitator(format!("failed to read {path} response: {e}")))?;

        // Facilitators answer invalid payments with a 4xx carrying the usual body,
        // so only treat it as an error when the body does not parse.
        serde_json::from_str::<T>(&text).map_err(|e| {
            tracing::error!(status = %status, body = %text, "unparseable facilitator response");
            McpayError::Facilitator(format!("invalid {path} response ({status}): {e}"))
        })
    }
}

#[async_trait]
impl PaymentVerifier for FacilitatorClient {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, McpayError> {
        self.post("verify", payload, requirements).await
    }
}

#[async_trait]
impl PaymentSettler for FacilitatorClient {
    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, McpayError> {
        self.post("settle", payload, requirements).await
    }
}
