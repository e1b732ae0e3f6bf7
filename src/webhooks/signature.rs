//! Webhook signature verification using HMAC-SHA256.
//!
//! Every source signs its payloads with a shared secret and sends the result
//! as `sha256=<hex>` (GitHub's `X-Hub-Signature-256` format). Verification
//! happens before the body is parsed or anything is written.

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parses a signature header (`sha256=<hex>`) into raw bytes.
///
/// Returns `None` for a missing prefix, another algorithm or invalid hex.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    hex::decode(header.strip_prefix("sha256=")?).ok()
}

/// Computes the HMAC-SHA256 of `payload` under `secret`.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Result<Vec<u8>, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Formats a signature as a header value (`sha256=<hex>`).
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verifies a signature header against the payload and secret, in constant time.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(expected) = parse_signature_header(signature_header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
