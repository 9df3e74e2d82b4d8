//! HMAC-SHA256 helpers shared by the webhook signer (§6 "Webhook
//! signature") and the bridge token scheme (§4.G "Token validation").
//! Follows the license-cache HMAC pattern (`license/mod.rs::compute_hmac`).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `HMAC-SHA256(secret, message)`, hex-encoded.
pub fn hmac_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Webhook payload signature: full hex digest of the raw body.
pub fn sign_webhook_body(secret: &str, raw_body: &[u8]) -> String {
    hmac_hex(secret, raw_body)
}

/// Bridge auth token: `HMAC-SHA256(secret, agent_id)` hex, truncated to
/// the first 32 characters (§4.G).
pub fn bridge_token(secret: &str, agent_id: &str) -> String {
    let full = hmac_hex(secret, agent_id.as_bytes());
    full.chars().take(32).collect()
}

/// Constant-time comparison, used for both webhook signature checks and
/// bridge token validation.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_token_is_32_hex_chars() {
        let token = bridge_token("shared-secret", "cursor/dev");
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn bridge_token_is_deterministic() {
        let a = bridge_token("shared-secret", "cursor/dev");
        let b = bridge_token("shared-secret", "cursor/dev");
        assert_eq!(a, b);
    }

    #[test]
    fn different_agent_ids_yield_different_tokens() {
        let a = bridge_token("shared-secret", "cursor/dev");
        let b = bridge_token("shared-secret", "replit/main");
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_eq_matches_ordinary_equality() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("short", "longer-string"));
    }
}
