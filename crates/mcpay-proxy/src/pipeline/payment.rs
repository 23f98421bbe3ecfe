//! Two-phase payment protocol: pre-authorization before dispatch, capture
//! after a genuine upstream execution.
//!
//! ```text
//! Unpriced ──(paid tool)──> PricedUnauthorized ──(verified)──> Verified ──(settled)──> Captured
//!                                   │                              │
//!                                   └──(missing/invalid)──> Failed <┘ (settlement failed)
//! ```
//!
//! Capture is only reachable from `Verified`, and [`PaymentState::capturable`]
//! refuses the transition for cache hits and failed upstream responses.

use mcpay::amount::format_units;
use mcpay::{
    decode_payment_header, PaymentPayload, PaymentRequiredBody, PaymentRequirements,
    SettleResponse, SigningIdentity, MAX_TIMEOUT_SECONDS, PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER,
    SCHEME_EXACT, X402_VERSION,
};

use crate::metrics::{PAYMENTS_TOTAL, TOOL_PAYMENTS, TOOL_REVENUE};
use crate::pipeline::context::{CacheStatus, ProxyResponse, RequestContext, ToolCall};
use crate::pipeline::Collaborators;
use crate::store::{PaymentRecord, PaymentStatus, PricingEntry};

/// An authorization that passed verification and awaits capture.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPayment {
    pub payload: PaymentPayload,
    pub requirements: PaymentRequirements,
    pub signature: String,
    pub payer: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentState {
    /// Free tool, or not a tool call at all.
    Unpriced,
    PricedUnauthorized {
        requirements: PaymentRequirements,
    },
    Verified(VerifiedPayment),
    Captured {
        signature: String,
        settlement: SettleResponse,
    },
    Failed {
        reason: String,
    },
}

impl PaymentState {
    /// Guarded `Verified -> Captured` transition: only a fresh (non-cached),
    /// successful upstream execution is settled.
    pub fn capturable(&self, upstream_status: u16, cache: CacheStatus) -> Option<&VerifiedPayment> {
        match self {
            PaymentState::Verified(verified)
                if upstream_status < 400 && cache != CacheStatus::Hit =>
            {
                Some(verified)
            }
            _ => None,
        }
    }
}

/// Build the payment requirement for a priced tool. Deterministic in its
/// inputs: capture settles against the requirement that was verified.
pub fn build_requirements(
    tool: &ToolCall,
    pricing: &PricingEntry,
    pay_to: &str,
) -> Result<PaymentRequirements, mcpay::McpayError> {
    let amount = format_units(&pricing.max_amount_required_raw, pricing.token_decimals)?;
    Ok(PaymentRequirements {
        scheme: SCHEME_EXACT.to_string(),
        network: pricing.network.clone(),
        amount,
        max_amount_required: pricing.max_amount_required_raw.clone(),
        resource: tool.resource(),
        description: tool
            .description
            .clone()
            .unwrap_or_else(|| format!("Paid tool call: {}", tool.name)),
        mime_type: "application/json".to_string(),
        pay_to: pay_to.to_string(),
        max_timeout_seconds: MAX_TIMEOUT_SECONDS,
        asset: pricing.asset_address.clone(),
        extra: Some(serde_json::json!({ "decimals": pricing.token_decimals })),
    })
}

/// 402 challenge: `{x402Version, error, accepts, payer?}`.
pub fn payment_required(
    error: impl Into<String>,
    accepts: Vec<PaymentRequirements>,
    payer: Option<String>,
) -> ProxyResponse {
    let body = PaymentRequiredBody {
        x402_version: X402_VERSION,
        error: error.into(),
        accepts,
        payer,
    };
    let value = serde_json::to_value(&body).unwrap_or_else(|_| serde_json::json!({}));
    ProxyResponse::gateway_json(402, &value)
}

fn reject(ctx: &mut RequestContext, reason: &str, response: ProxyResponse) -> ProxyResponse {
    PAYMENTS_TOTAL.with_label_values(&["rejected"]).inc();
    ctx.payment = PaymentState::Failed {
        reason: reason.to_string(),
    };
    response
}

fn payment_record(
    ctx: &RequestContext,
    verified: &VerifiedPayment,
    status: PaymentStatus,
    transaction_hash: Option<String>,
) -> Option<PaymentRecord> {
    let tool = ctx.tool_call.as_ref()?;
    let pricing = ctx.pricing.as_ref()?;
    Some(PaymentRecord {
        signature: verified.signature.clone(),
        server_id: tool.server_id.clone(),
        tool_id: tool.tool_id.clone().unwrap_or_else(|| tool.name.clone()),
        user_id: ctx.identity.user_id.clone(),
        amount_raw: pricing.max_amount_required_raw.clone(),
        token_decimals: pricing.token_decimals,
        asset: pricing.asset_address.clone(),
        network: pricing.network.clone(),
        payer: verified.payer.clone(),
        status,
        transaction_hash,
    })
}

/// Pre-authorization. Returns the 402 challenge when the call may not proceed.
pub async fn pre_authorize(ctx: &mut RequestContext, deps: &Collaborators) -> Option<ProxyResponse> {
    let Some(tool) = ctx.tool_call.clone().filter(|t| t.is_paid()) else {
        ctx.payment = PaymentState::Unpriced;
        return None;
    };

    let (Some(pricing), Some(pay_to)) = (ctx.pricing.clone(), tool.pay_to.clone()) else {
        tracing::warn!(tool = %tool.name, "paid tool without usable pricing or payee");
        let resp = payment_required("Payment configuration unavailable", Vec::new(), None);
        return Some(reject(ctx, "missing pricing", resp));
    };

    let requirements = match build_requirements(&tool, &pricing, &pay_to) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(tool = %tool.name, error = %e, "invalid pricing entry");
            let resp = payment_required("Payment configuration unavailable", Vec::new(), None);
            return Some(reject(ctx, "invalid pricing", resp));
        }
    };
    ctx.payment = PaymentState::PricedUnauthorized {
        requirements: requirements.clone(),
    };

    let mut header = ctx.request.header(PAYMENT_HEADER).map(str::to_string);

    if header.is_none() && ctx.identity.auto_sign_eligible() {
        if let Some(user_id) = ctx.identity.user_id.clone() {
            let identity = SigningIdentity {
                user_id,
                wallet_address: ctx.identity.wallet_address.clone(),
            };
            let signed = deps.signer.attempt_sign(&requirements, &identity).await;
            match signed.signed_auth.filter(|_| signed.success) {
                Some(auth) => {
                    tracing::info!(tool = %tool.name, "auto-signed payment authorization");
                    header = Some(auth);
                }
                None => tracing::debug!(
                    tool = %tool.name,
                    error = ?signed.error,
                    "auto-sign unavailable, falling back to challenge"
                ),
            }
        }
    }

    let Some(header) = header else {
        let resp = payment_required("X-PAYMENT header is required", vec![requirements], None);
        return Some(reject(ctx, "missing authorization", resp));
    };

    let payload = match decode_payment_header(&header) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "undecodable payment header");
            let resp = payment_required("Invalid X-PAYMENT header", vec![requirements], None);
            return Some(reject(ctx, "invalid authorization", resp));
        }
    };
    let Some(signature) = payload.idempotency_key().map(str::to_string) else {
        let resp = payment_required("Payment authorization has no signature", vec![requirements], None);
        return Some(reject(ctx, "unsigned authorization", resp));
    };

    match deps.payments.get_by_signature(&signature).await {
        Ok(Some(existing)) if existing.status == PaymentStatus::Completed => {
            tracing::info!(tool = %tool.name, signature = %signature, "authorization already settled");
            let resp = payment_required(
                "Payment authorization already settled",
                vec![requirements],
                existing.payer,
            );
            return Some(reject(ctx, "already settled", resp));
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(signature = %signature, error = %e, "payment lookup failed");
            let resp = payment_required(
                "Payment verification unavailable",
                vec![requirements],
                payload.payer().map(str::to_string),
            );
            return Some(reject(ctx, "payment store error", resp));
        }
    }

    let verification = match deps.verifier.verify(&payload, &requirements).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(tool = %tool.name, error = %e, "payment verification failed");
            let resp = payment_required(
                "Payment verification unavailable",
                vec![requirements],
                payload.payer().map(str::to_string),
            );
            return Some(reject(ctx, "verifier error", resp));
        }
    };

    let payer = verification
        .payer
        .clone()
        .or_else(|| payload.payer().map(str::to_string));
    if !verification.is_valid {
        let reason = verification
            .invalid_reason
            .unwrap_or_else(|| "Payment verification failed".to_string());
        tracing::info!(tool = %tool.name, reason = %reason, "payment rejected by verifier");
        let resp = payment_required(reason.clone(), vec![requirements], payer);
        return Some(reject(ctx, &reason, resp));
    }

    let verified = VerifiedPayment {
        payload,
        requirements,
        signature,
        payer,
    };
    PAYMENTS_TOTAL.with_label_values(&["verified"]).inc();

    if let Some(record) = payment_record(ctx, &verified, PaymentStatus::Pending, None) {
        match deps.payments.create(&record).await {
            Ok(true) => tracing::debug!(signature = %record.signature, "pending payment recorded"),
            Ok(false) => tracing::debug!(signature = %record.signature, "payment already recorded"),
            Err(e) => tracing::warn!(
                signature = %record.signature,
                error = %e,
                "failed to record pending payment"
            ),
        }
    }

    ctx.payment = PaymentState::Verified(verified);
    None
}

/// Capture: settle a verified authorization after the upstream produced a
/// fresh, successful response, and attach the receipt.
pub async fn capture(ctx: &mut RequestContext, deps: &Collaborators) {
    let Some(status) = ctx.response.as_ref().map(|r| r.status) else {
        return;
    };
    let Some(verified) = ctx.payment.capturable(status, ctx.cache_status).cloned() else {
        return;
    };
    let Some(tool) = ctx.tool_call.clone() else {
        return;
    };

    // A concurrent request with the same signature may have settled first
    if let Ok(Some(existing)) = deps.payments.get_by_signature(&verified.signature).await {
        if existing.status == PaymentStatus::Completed {
            tracing::warn!(signature = %verified.signature, "authorization already settled, skipping");
            ctx.payment = PaymentState::Failed {
                reason: "already settled".to_string(),
            };
            return;
        }
    }

    let settlement = match deps
        .settler
        .settle(&verified.payload, &verified.requirements)
        .await
    {
        Ok(s) if s.success => s,
        Ok(s) => {
            settlement_failed(ctx, &verified, s.error_reason.as_deref().unwrap_or("unknown"));
            return;
        }
        Err(e) => {
            settlement_failed(ctx, &verified, &e.to_string());
            return;
        }
    };

    if let Some(response) = ctx.response.as_mut() {
        response.set_header(PAYMENT_RESPONSE_HEADER, settlement.receipt_header());
    }

    let payer = settlement.payer.clone().or_else(|| verified.payer.clone());
    let settled = VerifiedPayment {
        payer,
        ..verified.clone()
    };
    if let Some(record) = payment_record(
        ctx,
        &settled,
        PaymentStatus::Completed,
        settlement.transaction.clone(),
    ) {
        if let Err(e) = deps.payments.update_status(&record).await {
            tracing::error!(
                signature = %record.signature,
                error = %e,
                "settled payment could not be marked completed"
            );
        }
        TOOL_PAYMENTS.with_label_values(&[record.tool_id.as_str()]).inc();
        let amount: u64 = record
            .amount_raw
            .parse::<u128>()
            .unwrap_or(0)
            .try_into()
            .unwrap_or(u64::MAX);
        TOOL_REVENUE.with_label_values(&[record.tool_id.as_str()]).inc_by(amount);
    }

    PAYMENTS_TOTAL.with_label_values(&["settled"]).inc();
    tracing::info!(
        tool = %tool.name,
        signature = %verified.signature,
        transaction = ?settlement.transaction,
        "payment settled"
    );
    ctx.payment = PaymentState::Captured {
        signature: verified.signature,
        settlement,
    };
}

/// The response was already delivered; the failure is logged and counted only.
fn settlement_failed(ctx: &mut RequestContext, verified: &VerifiedPayment, reason: &str) {
    PAYMENTS_TOTAL.with_label_values(&["settle_failed"]).inc();
    tracing::error!(
        signature = %verified.signature,
        reason = %reason,
        "settlement failed after upstream success; payment left pending"
    );
    ctx.payment = PaymentState::Failed {
        reason: reason.to_string(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::test_support::json_request;
    use crate::pipeline::fakes::{
        collaborators, payment_header, seeded_db, FakeSettler, FakeSigner, FakeVerifier, PAYER,
        SERVER_ID,
    };
    use crate::pipeline::inspect::inspect;
    use crate::store::{PaymentStore, ServerRecord};
    use std::sync::Arc;

    fn completed_record(signature: &str) -> PaymentRecord {
        PaymentRecord {
            signature: signature.to_string(),
            server_id: SERVER_ID.to_string(),
            tool_id: "tool-search".to_string(),
            user_id: None,
            amount_raw: "100".to_string(),
            token_decimals: 6,
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
            network: "base-sepolia".to_string(),
            payer: Some(PAYER.to_string()),
            status: PaymentStatus::Completed,
            transaction_hash: Some("0xtxhash".to_string()),
        }
    }

    async fn paid_context(deps: &Collaborators, payment: Option<String>) -> RequestContext {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "search", "arguments": {"q": "x"}}
        });
        let mut req = json_request(&format!("/proxy/{SERVER_ID}/mcp"), &body);
        if let Some(p) = payment {
            req.headers.push(("x-payment".to_string(), p));
        }
        let mut ctx = RequestContext::new(req, "r".into(), 0);
        inspect(&mut ctx, deps, "base-sepolia").await;
        ctx
    }

    #[test]
    fn test_capture_guard() {
        let verified = PaymentState::Verified(VerifiedPayment {
            payload: mcpay::decode_payment_header(&payment_header("0xsig")).unwrap(),
            requirements: PaymentRequirements {
                scheme: "exact".into(),
                network: "base".into(),
                amount: "0.0001".into(),
                max_amount_required: "100".into(),
                resource: "r".into(),
                description: "d".into(),
                mime_type: "application/json".into(),
                pay_to: "0xpay".into(),
                max_timeout_seconds: 300,
                asset: "0xasset".into(),
                extra: None,
            },
            signature: "0xsig".into(),
            payer: None,
        });
        assert!(verified.capturable(200, CacheStatus::Bypass).is_some());
        assert!(verified.capturable(200, CacheStatus::Miss).is_some());
        assert!(verified.capturable(200, CacheStatus::Hit).is_none());
        assert!(verified.capturable(500, CacheStatus::Bypass).is_none());
        assert!(PaymentState::Unpriced
            .capturable(200, CacheStatus::Bypass)
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_header_yields_challenge() {
        let deps = collaborators(seeded_db());
        let mut ctx = paid_context(&deps, None).await;

        let resp = pre_authorize(&mut ctx, &deps).await.unwrap();
        assert_eq!(resp.status, 402);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["x402Version"], 1);
        assert_eq!(body["accepts"][0]["amount"], "0.0001");
        assert_eq!(body["accepts"][0]["network"], "base-sepolia");
        assert_eq!(
            body["accepts"][0]["payTo"],
            "0x2222222222222222222222222222222222222222"
        );
        assert!(matches!(ctx.payment, PaymentState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_invalid_authorization_is_rejected_with_reason() {
        let mut deps = collaborators(seeded_db());
        deps.verifier = Arc::new(FakeVerifier::invalid("insufficient_funds"));
        let mut ctx = paid_context(&deps, Some(payment_header("0xsig"))).await;

        let resp = pre_authorize(&mut ctx, &deps).await.unwrap();
        assert_eq!(resp.status, 402);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["error"], "insufficient_funds");
        assert_eq!(body["payer"], "0x1111111111111111111111111111111111111111");
    }

    #[tokio::test]
    async fn test_verified_payment_is_recorded_once() {
        let db = seeded_db();
        let deps = collaborators(db.clone());

        for _ in 0..3 {
            let mut ctx = paid_context(&deps, Some(payment_header("0xsig-replay"))).await;
            assert!(pre_authorize(&mut ctx, &deps).await.is_none());
            assert!(matches!(ctx.payment, PaymentState::Verified(_)));
        }
        assert_eq!(db.count_payments("0xsig-replay").unwrap(), 1);
        let stored = db.get_by_signature("0xsig-replay").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_unpriced_tool_skips_payment() {
        let db = seeded_db();
        let deps = collaborators(db.clone());
        let body = serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "echo"}
        });
        let mut ctx = RequestContext::new(
            json_request(&format!("/proxy/{SERVER_ID}/mcp"), &body),
            "r".into(),
            0,
        );
        inspect(&mut ctx, &deps, "base-sepolia").await;
        assert!(pre_authorize(&mut ctx, &deps).await.is_none());
        assert_eq!(ctx.payment, PaymentState::Unpriced);
    }

    #[tokio::test]
    async fn test_auto_sign_for_api_key_callers() {
        let db = seeded_db();
        let mut deps = collaborators(db.clone());
        deps.signer = Arc::new(FakeSigner::signing(payment_header("0xauto")));

        let mut ctx = paid_context(&deps, None).await;
        ctx.identity = crate::pipeline::context::Identity {
            user_id: Some("u-1".to_string()),
            wallet_address: Some("0x1111111111111111111111111111111111111111".to_string()),
            method: crate::pipeline::context::AuthMethod::ApiKey,
            managed_wallet_hint: false,
        };
        assert!(pre_authorize(&mut ctx, &deps).await.is_none());
        assert_eq!(db.count_payments("0xauto").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capture_settles_and_attaches_receipt() {
        let db = seeded_db();
        let settler = Arc::new(FakeSettler::succeeding());
        let mut deps = collaborators(db.clone());
        deps.settler = settler.clone();

        let mut ctx = paid_context(&deps, Some(payment_header("0xcap"))).await;
        assert!(pre_authorize(&mut ctx, &deps).await.is_none());
        ctx.response = Some(ProxyResponse {
            source: crate::pipeline::context::ResponseSource::Upstream,
            ..ProxyResponse::gateway(200)
        });
        capture(&mut ctx, &deps).await;

        assert_eq!(settler.calls(), 1);
        assert!(ctx
            .response
            .as_ref()
            .unwrap()
            .header("x-payment-response")
            .is_some());
        let stored = db.get_by_signature("0xcap").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
        assert_eq!(stored.transaction_hash.as_deref(), Some("0xtxhash"));
        assert!(matches!(ctx.payment, PaymentState::Captured { .. }));
    }

    #[tokio::test]
    async fn test_failed_settlement_leaves_response_untouched() {
        let db = seeded_db();
        let mut deps = collaborators(db.clone());
        deps.settler = Arc::new(FakeSettler::failing("nonce_used"));

        let mut ctx = paid_context(&deps, Some(payment_header("0xfail"))).await;
        assert!(pre_authorize(&mut ctx, &deps).await.is_none());
        ctx.response = Some(ProxyResponse::gateway(200));
        capture(&mut ctx, &deps).await;

        assert_eq!(ctx.response.as_ref().unwrap().status, 200);
        assert!(ctx
            .response
            .as_ref()
            .unwrap()
            .header("x-payment-response")
            .is_none());
        let stored = db.get_by_signature("0xfail").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert!(matches!(ctx.payment, PaymentState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_upstream_error_is_not_captured() {
        let settler = Arc::new(FakeSettler::succeeding());
        let mut deps = collaborators(seeded_db());
        deps.settler = settler.clone();

        let mut ctx = paid_context(&deps, Some(payment_header("0x5xx"))).await;
        assert!(pre_authorize(&mut ctx, &deps).await.is_none());
        ctx.response = Some(ProxyResponse::gateway(502));
        capture(&mut ctx, &deps).await;
        assert_eq!(settler.calls(), 0);
        assert!(matches!(ctx.payment, PaymentState::Verified(_)));
    }

    #[tokio::test]
    async fn test_missing_payee_yields_empty_accepts() {
        let db = seeded_db();
        db.insert_server(&ServerRecord {
            id: SERVER_ID.to_string(),
            origin_url: "https://tools.example.com/mcp".to_string(),
            receiver_address: String::new(),
            name: None,
        })
        .unwrap();
        let deps = collaborators(db.clone());
        let mut ctx = paid_context(&deps, Some(payment_header("0xnopayee"))).await;

        let resp = pre_authorize(&mut ctx, &deps).await.unwrap();
        assert_eq!(resp.status, 402);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["accepts"], serde_json::json!([]));
        assert!(matches!(ctx.payment, PaymentState::Failed { .. }));
        assert_eq!(db.count_payments("0xnopayee").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_verifier_fails_closed() {
        let db = seeded_db();
        let verifier = Arc::new(FakeVerifier::unreachable());
        let mut deps = collaborators(db.clone());
        deps.verifier = verifier.clone();
        let mut ctx = paid_context(&deps, Some(payment_header("0xoffline"))).await;

        let resp = pre_authorize(&mut ctx, &deps).await.unwrap();
        assert_eq!(resp.status, 402);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["error"], "Payment verification unavailable");
        assert_eq!(verifier.calls(), 1);
        assert_eq!(db.count_payments("0xoffline").unwrap(), 0);
        assert!(matches!(ctx.payment, PaymentState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_settled_authorization_cannot_be_reused() {
        let db = seeded_db();
        db.update_status(&completed_record("0xspent")).await.unwrap();
        let verifier = Arc::new(FakeVerifier::valid());
        let mut deps = collaborators(db.clone());
        deps.verifier = verifier.clone();

        let mut ctx = paid_context(&deps, Some(payment_header("0xspent"))).await;
        let resp = pre_authorize(&mut ctx, &deps).await.unwrap();

        assert_eq!(resp.status, 402);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["error"], "Payment authorization already settled");
        assert_eq!(verifier.calls(), 0);
        assert!(matches!(ctx.payment, PaymentState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_capture_skips_signature_settled_meanwhile() {
        let db = seeded_db();
        let settler = Arc::new(FakeSettler::succeeding());
        let mut deps = collaborators(db.clone());
        deps.settler = settler.clone();

        let mut ctx = paid_context(&deps, Some(payment_header("0xrace"))).await;
        assert!(pre_authorize(&mut ctx, &deps).await.is_none());
        db.update_status(&completed_record("0xrace")).await.unwrap();
        ctx.response = Some(ProxyResponse {
            source: crate::pipeline::context::ResponseSource::Upstream,
            ..ProxyResponse::gateway(200)
        });
        capture(&mut ctx, &deps).await;

        assert_eq!(settler.calls(), 0);
        assert!(ctx
            .response
            .as_ref()
            .unwrap()
            .header("x-payment-response")
            .is_none());
    }
}
