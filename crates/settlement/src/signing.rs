//! HMAC-SHA256 webhook signatures.
//!
//! The signed message is `"{timestamp}.{payload}"` and the header value is
//! `sha256=<lowercase hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

/// Signs a payload for the given unix timestamp.
pub fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
    let digest = mac(secret, timestamp, payload).finalize().into_bytes();
    format!("{PREFIX}{}", hex::encode(digest))
}

/// Checks a `sha256=<hex>` header against the payload in constant time.
pub fn verify(secret: &str, timestamp: i64, payload: &str, signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix(PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    mac(secret, timestamp, payload).verify_slice(&expected).is_ok()
}

fn mac(secret: &str, timestamp: i64, payload: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC takes keys of any size"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    mac
}
