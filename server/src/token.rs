//! Session token minting.
//!
//! Tokens are opaque bearer strings handed to the browser as the
//! `demo_session` cookie and checked by the reverse proxy's auth sub-request.
//! Shape: `base64("<id>:<unix_millis>") + "." + hex(hmac_sha256(payload))`.
//!
//! The encoded payload exists for offline debuggability only — validation
//! never decodes it. Membership is decided solely against the coordinator's
//! token maps, so the minter has no verify path.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Mints session tokens signed with a process-wide secret.
#[derive(Clone)]
pub struct TokenMinter {
    secret: Arc<String>,
}

impl TokenMinter {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Arc::new(secret.to_string()),
        }
    }

    /// Mint a token bound to `id` (a client id before promotion, a session id
    /// conceptually after — the string is never re-minted for the same
    /// millisecond+id pair, which suffices for uniqueness in practice).
    pub fn mint(&self, id: &str) -> String {
        let payload = format!("{id}:{}", Utc::now().timestamp_millis());
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("{}.{sig}", BASE64.encode(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_has_payload_and_signature() {
        let minter = TokenMinter::new("test-secret");
        let token = minter.mint("abc123");

        let (payload_b64, sig) = token.split_once('.').unwrap();
        let payload = String::from_utf8(BASE64.decode(payload_b64).unwrap()).unwrap();
        let (id, millis) = payload.split_once(':').unwrap();
        assert_eq!(id, "abc123");
        assert!(millis.parse::<i64>().unwrap() > 0);
        // hex-encoded SHA-256 MAC
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_depends_on_secret() {
        let a = TokenMinter::new("secret-a").mint("client");
        let b = TokenMinter::new("secret-b").mint("client");
        let sig_a = a.split_once('.').unwrap().1;
        let sig_b = b.split_once('.').unwrap().1;
        assert_ne!(sig_a, sig_b);
    }

    #[test]
    fn distinct_ids_mint_distinct_tokens() {
        let minter = TokenMinter::new("test-secret");
        assert_ne!(minter.mint("one"), minter.mint("two"));
    }
}
