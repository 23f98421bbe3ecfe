//! The per-request proxy pipeline.
//!
//! Request steps run strictly in order over one [`RequestContext`]; the first
//! step that produces a response ends the request phase. Response steps then
//! always run, each guarding itself on the state it needs.
//!
//! ```text
//! auth → framing → inspect → headers → forward → cache read → rate limit
//!      → pre-auth → invoke (retry/backoff)
//!      ⇒ cache write → capture → analytics
//! ```

pub mod analytics;
pub mod auth;
pub mod cache;
pub mod context;
pub mod forward;
pub mod framing;
pub mod headers;
pub mod inspect;
pub mod payment;
pub mod rate_limit;
pub mod upstream;

#[cfg(test)]
pub(crate) mod fakes;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use mcpay::{AutoSigner, PaymentSettler, PaymentVerifier, CACHE_STATUS_HEADER};

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::error::ProxyError;
use crate::metrics::{
    CACHE_EVENTS, FRAMING_SHORT_CIRCUITS, PROXY_LATENCY, PROXY_REQUESTS_TOTAL, RATE_LIMIT_WAIT,
};
use crate::store::{IdentityStore, PaymentStore, ServerCatalog, SessionValidator, UsageRecorder};

use cache::{CachedResponse, ResponseCache};
use context::{CacheStatus, InboundRequest, ProxyResponse, RequestContext, ResponseSource};
use inspect::Inspection;
use rate_limit::RateLimiter;
use upstream::OutboundRequest;

pub use context::{AuthMethod, Identity, ToolCall};
pub use payment::PaymentState;

/// External collaborators the pipeline consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn ServerCatalog>,
    pub identities: Arc<dyn IdentityStore>,
    pub sessions: Arc<dyn SessionValidator>,
    pub verifier: Arc<dyn PaymentVerifier>,
    pub settler: Arc<dyn PaymentSettler>,
    pub signer: Arc<dyn AutoSigner>,
    pub payments: Arc<dyn PaymentStore>,
    pub usage: Arc<dyn UsageRecorder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStep {
    Auth,
    Framing,
    Inspect,
    Headers,
    Forward,
    CacheRead,
    RateLimit,
    PreAuth,
    Invoke,
}

const REQUEST_STEPS: &[RequestStep] = &[
    RequestStep::Auth,
    RequestStep::Framing,
    RequestStep::Inspect,
    RequestStep::Headers,
    RequestStep::Forward,
    RequestStep::CacheRead,
    RequestStep::RateLimit,
    RequestStep::PreAuth,
    RequestStep::Invoke,
];

type StepResult = ControlFlow<ProxyResponse>;

pub struct Pipeline {
    config: PipelineConfig,
    deps: Collaborators,
    http: reqwest::Client,
    limiter: RateLimiter,
    cache: ResponseCache,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        deps: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none()) // Prevent SSRF via redirects
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            limiter: RateLimiter::new(config.rate_limit, clock.clone()),
            cache: ResponseCache::new(config.cache.clone(), clock.clone()),
            config,
            deps,
            http,
            clock,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Run [`Pipeline::handle`] on its own task. Dropping the returned future
    /// (client disconnect) leaves the task, and any settlement in it, running.
    pub async fn handle_detached(
        self: Arc<Self>,
        request: InboundRequest,
        request_id: String,
    ) -> ProxyResponse {
        let task = tokio::spawn(
            async move { self.handle(request, request_id).await }.in_current_span(),
        );
        match task.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "pipeline task failed");
                ProxyResponse::error(500, "internal_error", "An internal error occurred")
            }
        }
    }

    /// Run one request through every step and return the client response.
    pub async fn handle(&self, request: InboundRequest, request_id: String) -> ProxyResponse {
        let mut ctx = RequestContext::new(request, request_id, self.clock.now_millis());

        for step in REQUEST_STEPS {
            if let ControlFlow::Break(response) = self.run_step(*step, &mut ctx).await {
                ctx.response = Some(response);
                break;
            }
        }
        if ctx.response.is_none() {
            ctx.response = Some(ProxyResponse::error(
                500,
                "internal_error",
                "An internal error occurred",
            ));
        }

        self.write_cache(&ctx);
        payment::capture(&mut ctx, &self.deps).await;
        let latency_ms = self.clock.now_millis().saturating_sub(ctx.started_at_ms);
        analytics::record(&ctx, &self.deps, latency_ms).await;

        self.finish(ctx, latency_ms)
    }

    async fn run_step(&self, step: RequestStep, ctx: &mut RequestContext) -> StepResult {
        match step {
            RequestStep::Auth => {
                ctx.identity = auth::resolve_identity(&ctx.request, &self.deps).await;
                ControlFlow::Continue(())
            }
            RequestStep::Framing => {
                if framing::inspect_framing(ctx) {
                    FRAMING_SHORT_CIRCUITS.inc();
                    return ControlFlow::Break(ProxyResponse::gateway(202));
                }
                ControlFlow::Continue(())
            }
            RequestStep::Inspect => {
                match inspect::inspect(ctx, &self.deps, &self.config.default_network).await {
                    Inspection::Proceed => ControlFlow::Continue(()),
                    Inspection::MultipleToolCalls => ControlFlow::Break(ProxyResponse::error(
                        400,
                        "bad_request",
                        "tools/call requests must not be batched",
                    )),
                }
            }
            RequestStep::Headers => {
                ctx.outbound_headers =
                    headers::prepare_headers(&ctx.request, ctx.identity.wallet_address.as_deref());
                ControlFlow::Continue(())
            }
            RequestStep::Forward => match forward::forward(ctx) {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => ControlFlow::Break(error_response(&e)),
            },
            RequestStep::CacheRead => self.read_cache(ctx),
            RequestStep::RateLimit => {
                if let Some(host) = ctx.upstream_host().map(str::to_string) {
                    let waited = self.limiter.acquire(&host).await;
                    RATE_LIMIT_WAIT.observe(waited.as_secs_f64());
                }
                ControlFlow::Continue(())
            }
            RequestStep::PreAuth => match payment::pre_authorize(ctx, &self.deps).await {
                Some(challenge) => ControlFlow::Break(challenge),
                None => ControlFlow::Continue(()),
            },
            RequestStep::Invoke => ControlFlow::Break(self.invoke(ctx).await),
        }
    }

    fn read_cache(&self, ctx: &mut RequestContext) -> StepResult {
        if ctx.request.method != "GET" || ctx.cache_status == CacheStatus::Bypass {
            return ControlFlow::Continue(());
        }
        let Some(key) = ctx.cache_key.as_deref() else {
            return ControlFlow::Continue(());
        };
        match self.cache.get(key) {
            Some(cached) => {
                ctx.cache_status = CacheStatus::Hit;
                ControlFlow::Break(ProxyResponse {
                    status: cached.status,
                    headers: cached.headers,
                    body: cached.body,
                    source: ResponseSource::Cache,
                })
            }
            None => {
                ctx.cache_status = CacheStatus::Miss;
                ControlFlow::Continue(())
            }
        }
    }

    async fn invoke(&self, ctx: &RequestContext) -> ProxyResponse {
        let Some(url) = ctx.upstream_url.clone() else {
            return error_response(&ProxyError::Internal(
                "upstream URL was not resolved".to_string(),
            ));
        };
        let method = match reqwest::Method::from_bytes(ctx.request.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return error_response(&ProxyError::BadRequest(format!(
                    "unsupported HTTP method: {}",
                    ctx.request.method
                )))
            }
        };
        let request = OutboundRequest {
            method,
            url,
            headers: ctx.outbound_headers.clone(),
            body: ctx.body.clone(),
        };

        match upstream::invoke(&self.http, &request, &self.config.retry, self.clock.as_ref()).await
        {
            Ok(response) => response,
            Err(e) => error_response(&e),
        }
    }

    /// Store fresh, successful, non-streaming GET responses.
    fn write_cache(&self, ctx: &RequestContext) {
        if ctx.request.method != "GET" || ctx.cache_status != CacheStatus::Miss {
            return;
        }
        let (Some(response), Some(key), Some(host)) =
            (ctx.response.as_ref(), ctx.cache_key.as_ref(), ctx.upstream_host())
        else {
            return;
        };
        if response.source != ResponseSource::Upstream
            || response.status >= 400
            || response.is_event_stream()
        {
            return;
        }
        self.cache.put(
            key.clone(),
            host,
            CachedResponse {
                status: response.status,
                headers: response.headers.clone(),
                body: response.body.clone(),
            },
        );
    }

    fn finish(&self, ctx: RequestContext, latency_ms: u64) -> ProxyResponse {
        let cache_status = ctx.cache_status;
        let request_id = ctx.request_id;
        let mut response = ctx
            .response
            .unwrap_or_else(|| ProxyResponse::gateway(500));

        response.set_header(CACHE_STATUS_HEADER, cache_status.as_str());
        if response.header("x-request-id").is_none() {
            response.set_header("x-request-id", request_id);
        }

        CACHE_EVENTS
            .with_label_values(&[cache_status.as_str()])
            .inc();
        PROXY_REQUESTS_TOTAL
            .with_label_values(&[response.status.to_string().as_str()])
            .inc();
        PROXY_LATENCY.observe(Duration::from_millis(latency_ms).as_secs_f64());
        response
    }
}

fn error_response(err: &ProxyError) -> ProxyResponse {
    match err {
        ProxyError::ServerNotFound(id) => {
            ProxyResponse::error(404, "server_not_found", format!("Server '{}' not found", id))
        }
        ProxyError::BadRequest(msg) => ProxyResponse::error(400, "bad_request", msg.clone()),
        ProxyError::Upstream(msg) => {
            tracing::error!("Upstream error: {}", msg);
            ProxyResponse::error(502, "upstream_error", "Failed to reach upstream server")
        }
        other => {
            tracing::error!("Internal error: {}", other);
            ProxyResponse::error(500, "internal_error", "An internal error occurred")
        }
    }
}
