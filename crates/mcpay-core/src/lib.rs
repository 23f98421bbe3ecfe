//! x402 payment protocol pieces used by the mcpay tool proxy.
//!
//! The proxy never signs or settles value transfers itself. It builds
//! [`PaymentRequirements`] for a priced tool, decodes the client's `X-PAYMENT`
//! authorization into a [`PaymentPayload`], and hands both to external
//! collaborators:
//!
//! - **Verifier** ([`PaymentVerifier`]): checks an authorization before dispatch
//! - **Settler** ([`PaymentSettler`]): redeems it after the upstream succeeded
//! - **Auto-signer** ([`AutoSigner`]): signs on behalf of managed wallets
//!
//! [`FacilitatorClient`] implements the first two over HTTP, [`RemoteSigner`]
//! the third.

pub mod address;
pub mod amount;
pub mod constants;
pub mod error;
pub mod facilitator_client;
pub mod hmac;
pub mod payment;
pub mod response;
pub mod scheme;
pub mod security;
pub mod signer_client;

pub use address::WalletChain;
pub use constants::*;
pub use error::McpayError;
pub use facilitator_client::FacilitatorClient;
pub use payment::*;
pub use response::*;
pub use scheme::*;
pub use signer_client::RemoteSigner;
