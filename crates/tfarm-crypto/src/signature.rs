//! Identity signature for the managed frpc configuration.
//!
//! The daemon proves its identity to the upstream by signing its client ID
//! with the provisioned secret. The encoding is base64url with padding; it is
//! part of the wire contract with the upstream config reader, so exactly one
//! encoding is supported.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the HMAC-SHA256 signature of `data` keyed by `secret`.
///
/// Deterministic: identical inputs always produce identical output.
pub fn hmac_signature(secret: &[u8], data: &[u8]) -> String {
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any size");
    mac.update(data);
    URL_SAFE.encode(mac.finalize().into_bytes())
}
