//! Shared-secret signatures on remote engine callbacks.
//!
//! The MAC covers the run id from the callback URL followed by the raw body,
//! so a signed report is only valid for the run it was issued for.

use subtle::ConstantTimeEq;

pub const SIGNATURE_HEADER: &str = "x-flowrun-signature";

const KEY_CONTEXT: &str = "flowrun callback v1";

fn signing_key(secret: &str) -> [u8; 32] {
    blake3::derive_key(KEY_CONTEXT, secret.as_bytes())
}

fn mac(secret: &str, run_id: i64, body: &[u8]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_keyed(&signing_key(secret));
    hasher.update(format!("{run_id}\n").as_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Hex-encoded keyed BLAKE3 MAC of `"{run_id}\n"` followed by the raw body.
pub fn sign(secret: &str, run_id: i64, body: &[u8]) -> String {
    hex::encode(mac(secret, run_id, body).as_bytes())
}

/// Constant-time comparison of `signature` against the expected MAC.
pub fn verify(secret: &str, run_id: i64, body: &[u8], signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let expected = mac(secret, run_id, body);
    bool::from(expected.as_bytes().as_slice().ct_eq(provided.as_slice()))
}
