use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_FACILITATOR_URL: &str = "https://x402.org/facilitator";
const DEFAULT_PORT: u16 = 4024;
const DEFAULT_DB_PATH: &str = "./mcpay.db";
const DEFAULT_RATE_LIMIT_RPM: u32 = 600;

/// Per-upstream-host token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Bucket capacity `C`.
    pub capacity: f64,
    /// Refill rate `R` in tokens per second.
    pub refill_per_sec: f64,
    /// Minimum spacing `D` between two requests to the same host.
    pub min_spacing: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5.0,
            refill_per_sec: 2.0,
            min_spacing: Duration::from_millis(100),
        }
    }
}

/// Upstream retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt (3 means at most 4 tries).
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound applied to upstream `Retry-After` values.
    pub retry_after_cap: Duration,
    /// Upper bound on the random jitter added to exponential delays.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(300),
            retry_after_cap: Duration::from_secs(10),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

/// Response cache TTL heuristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub long_ttl: Duration,
    /// Host fragments that mark slower-changing upstreams (docs, static content).
    pub long_ttl_hosts: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            long_ttl: Duration::from_secs(600),
            long_ttl_hosts: ["docs.", "static.", "cdn.", "raw.githubusercontent.com"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Settings the request pipeline needs, independent of the HTTP server.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub default_network: String,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub upstream_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_network: mcpay::DEFAULT_NETWORK.to_string(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct ProxyConfig {
    /// Server port
    pub port: u16,
    /// SQLite database path
    pub db_path: String,
    /// Facilitator URL for payment verification and settlement
    pub facilitator_url: String,
    /// HMAC shared secret for facilitator auth (None = dev mode)
    pub hmac_secret: Option<Vec<u8>>,
    /// Managed-wallet signer URL (None = auto-signing disabled)
    pub signer_url: Option<String>,
    /// Session verification URL (None = session tokens are ignored)
    pub session_verify_url: Option<String>,
    /// CORS allowed origins
    pub allowed_origins: Vec<String>,
    /// Inbound requests per minute per client IP
    pub rate_limit_rpm: u32,
    /// Bearer token required for /metrics (None = public)
    pub metrics_token: Option<String>,
    pub pipeline: PipelineConfig,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("port", &self.port)
            .field("db_path", &self.db_path)
            .field("facilitator_url", &self.facilitator_url)
            .field(
                "hmac_secret",
                &self.hmac_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("signer_url", &self.signer_url)
            .field("session_verify_url", &self.session_verify_url)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_var("PORT", DEFAULT_PORT)?;
        let db_path = env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

        let facilitator_url =
            env::var("FACILITATOR_URL").unwrap_or_else(|_| DEFAULT_FACILITATOR_URL.to_string());
        validate_url(&facilitator_url)?;

        let hmac_secret = env::var("FACILITATOR_SHARED_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| s.into_bytes());

        let signer_url = optional_url("SIGNER_URL")?;
        let session_verify_url = optional_url("SESSION_VERIFY_URL")?;

        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .map(|s| split_list(&s))
            .unwrap_or_else(|_| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ]
            });

        let rate_limit_rpm = parse_var("RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM)?;
        let metrics_token = env::var("METRICS_TOKEN").ok().filter(|s| !s.is_empty());

        let defaults = PipelineConfig::default();
        let rate_limit = RateLimitConfig {
            capacity: parse_var("UPSTREAM_BUCKET_CAPACITY", defaults.rate_limit.capacity)?,
            refill_per_sec: parse_var(
                "UPSTREAM_REFILL_PER_SEC",
                defaults.rate_limit.refill_per_sec,
            )?,
            min_spacing: Duration::from_millis(parse_var(
                "UPSTREAM_MIN_SPACING_MS",
                defaults.rate_limit.min_spacing.as_millis() as u64,
            )?),
        };
        if rate_limit.capacity < 1.0 || rate_limit.refill_per_sec <= 0.0 {
            return Err(ConfigError::Invalid(
                "UPSTREAM_BUCKET_CAPACITY must be >= 1 and UPSTREAM_REFILL_PER_SEC > 0"
                    .to_string(),
            ));
        }

        let retry = RetryConfig {
            max_retries: parse_var("UPSTREAM_MAX_RETRIES", defaults.retry.max_retries)?,
            base_delay: Duration::from_millis(parse_var(
                "UPSTREAM_RETRY_BASE_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
            retry_after_cap: Duration::from_secs(parse_var(
                "UPSTREAM_RETRY_AFTER_CAP_SECS",
                defaults.retry.retry_after_cap.as_secs(),
            )?),
            max_jitter: defaults.retry.max_jitter,
        };

        let cache = CacheConfig {
            default_ttl: Duration::from_secs(parse_var(
                "CACHE_TTL_SECS",
                defaults.cache.default_ttl.as_secs(),
            )?),
            long_ttl: Duration::from_secs(parse_var(
                "CACHE_LONG_TTL_SECS",
                defaults.cache.long_ttl.as_secs(),
            )?),
            long_ttl_hosts: env::var("CACHE_LONG_TTL_HOSTS")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.cache.long_ttl_hosts),
        };

        let pipeline = PipelineConfig {
            default_network: env::var("DEFAULT_NETWORK")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.default_network),
            rate_limit,
            retry,
            cache,
            upstream_timeout: Duration::from_secs(parse_var(
                "UPSTREAM_TIMEOUT_SECS",
                defaults.upstream_timeout.as_secs(),
            )?),
        };

        let insecure_no_hmac = env::var("MCPAY_INSECURE_NO_HMAC")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        if let Some(ref secret) = hmac_secret {
            if secret.len() < 32 {
                tracing::warn!(
                    "FACILITATOR_SHARED_SECRET is too short ({} bytes, minimum 32)",
                    secret.len()
                );
            }
        } else if insecure_no_hmac {
            tracing::warn!(
                "MCPAY_INSECURE_NO_HMAC=true: facilitator requests are unauthenticated, \
                 do not use this in production"
            );
        } else {
            tracing::error!(
                "FACILITATOR_SHARED_SECRET is required. \
                 For local development only, set MCPAY_INSECURE_NO_HMAC=true to skip."
            );
            return Err(ConfigError::MissingRequired("FACILITATOR_SHARED_SECRET"));
        }

        if allowed_origins.iter().any(|o| o == "*") && !insecure_no_hmac {
            return Err(ConfigError::Invalid(
                "wildcard CORS origin '*' is not allowed in production".to_string(),
            ));
        }

        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set: /metrics endpoint is publicly accessible");
        }

        Ok(Self {
            port,
            db_path,
            facilitator_url,
            hmac_secret,
            signer_url,
            session_verify_url,
            allowed_origins,
            rate_limit_rpm,
            metrics_token,
            pipeline,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(name, raw)),
        _ => Ok(default),
    }
}

fn optional_url(name: &'static str) -> Result<Option<String>, ConfigError> {
    match env::var(name).ok().filter(|s| !s.is_empty()) {
        Some(url) => {
            validate_url(&url)?;
            Ok(Some(url))
        }
        None => Ok(None),
    }
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    Url::parse(url)
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidUrl(url.to_string()))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value for {0}: {1}")]
    InvalidNumber(&'static str, String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
