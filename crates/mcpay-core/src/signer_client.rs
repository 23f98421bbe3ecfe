//! HTTP client for the managed-wallet signing service.

use async_trait::async_trait;
use std::time::Duration;

use crate::payment::PaymentRequirements;
use crate::response::SigningResult;
use crate::scheme::{AutoSigner, SigningIdentity};

const SIGNER_TIMEOUT: Duration = Duration::from_secs(15);

/// Asks a remote signer to produce an `X-PAYMENT` value for a managed wallet.
#[derive(Debug, Clone)]
pub struct RemoteSigner {
    http: reqwest::Client,
    base_url: String,
}

impl RemoteSigner {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AutoSigner for RemoteSigner {
    async fn attempt_sign(
        &self,
        requirements: &PaymentRequirements,
        identity: &SigningIdentity,
    ) -> SigningResult {
        let url = format!("{}/sign", self.base_url);
        let body = serde_json::json!({
            "paymentRequirements": requirements,
            "userId": identity.user_id,
            "walletAddress": identity.wallet_address,
        });

        let resp = match self
            .http
            .post(&url)
            .json(&body)
            .timeout(SIGNER_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return SigningResult::failed(format!("signer request failed: {e}")),
        };

        if !resp.status().is_success() {
            return SigningResult::failed(format!("signer returned {}", resp.status()));
        }

        match resp.json::<SigningResult>().await {
            Ok(result) if result.success && result.signed_auth.is_none() => {
                SigningResult::failed("signer reported success without an authorization")
            }
            Ok(result) => result,
            Err(e) => SigningResult::failed(format!("signer response parse failed: {e}")),
        }
    }
}
