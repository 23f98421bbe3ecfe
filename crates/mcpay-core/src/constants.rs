/// x402 protocol version spoken on the wire.
pub const X402_VERSION: u32 = 1;

/// Only the "exact" transfer scheme is priced by the proxy.
pub const SCHEME_EXACT: &str = "exact";

/// Network preferred when a tool is priced on several networks.
pub const DEFAULT_NETWORK: &str = "base-sepolia";

/// Client-supplied payment authorization (base64 JSON).
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

/// Settlement receipt returned to the client on captured calls.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// Fallback caller identity, also injected on outbound requests.
pub const WALLET_ADDRESS_HEADER: &str = "X-Wallet-Address";

/// Managed wallet hints that make a wallet-header caller eligible for auto-signing.
pub const WALLET_PROVIDER_HEADER: &str = "x-wallet-provider";
pub const WALLET_TYPE_HEADER: &str = "x-wallet-type";

/// Cache status header: `HIT`, `MISS` or `BYPASS`.
pub const CACHE_STATUS_HEADER: &str = "x-mcpay-cache";

/// HMAC signature header on requests to the facilitator.
pub const FACILITATOR_AUTH_HEADER: &str = "X-Facilitator-Auth";

/// Upper bound on how long a signed authorization stays redeemable.
pub const MAX_TIMEOUT_SECONDS: u64 = 300;
