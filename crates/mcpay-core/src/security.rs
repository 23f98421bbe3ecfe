use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time comparison that leaks neither content nor length: both sides
/// are hashed to SHA-256 digests before `subtle` compares them.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

/// Hex SHA-256 digest. API keys are only ever stored and looked up by this hash.
pub fn sha256_hex(input: &[u8]) -> String {
    alloy::hex::encode(Sha256::digest(input))
}
