//! Wallet address shape detection.
//!
//! Callers identified only by an `X-Wallet-Address` header are attached to a
//! user record per chain family, so the family is guessed from the address.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletChain {
    Evm,
    Solana,
}

impl WalletChain {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletChain::Evm => "evm",
            WalletChain::Solana => "solana",
        }
    }

    /// Guess the chain family from the textual shape of an address.
    pub fn guess(address: &str) -> Option<Self> {
        let address = address.trim();
        if address.starts_with("0x") {
            return address.parse::<Address>().ok().map(|_| WalletChain::Evm);
        }
        let base58 = (32..=44).contains(&address.len())
            && address.chars().all(|c| BASE58_ALPHABET.contains(c));
        base58.then_some(WalletChain::Solana)
    }
}

/// Canonical form used as a storage key: checksummed for EVM, verbatim otherwise.
pub fn normalize_address(address: &str) -> String {
    let address = address.trim();
    match address.parse::<Address>() {
        Ok(parsed) if address.starts_with("0x") => parsed.to_checksum(None),
        _ => address.to_string(),
    }
}
