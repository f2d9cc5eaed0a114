//! Raw token minting and keyed hashing
//!
//! Raw tokens are 32 random bytes, URL-safe base64. Storage holds only an
//! HMAC-SHA256 of the raw value under the server secret, so a leaked store
//! cannot be replayed into download URLs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Mints and hashes delivery tokens under one server secret.
#[derive(Clone)]
pub struct TokenMinter {
    secret: String,
}

pub struct MintedToken {
    pub token_id: String,
    /// Leaves the process exactly once, inside the portal link
    pub raw_token: String,
    pub token_hash: String,
}

impl TokenMinter {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Generate a fresh raw token and its storable hash.
    pub fn mint(&self) -> MintedToken {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let raw_token = URL_SAFE_NO_PAD.encode(bytes);
        let token_hash = self.hash(&raw_token);
        MintedToken {
            token_id: format!("dt_{}", Uuid::new_v4().simple()),
            raw_token,
            token_hash,
        }
    }

    /// Keyed hash of a presented raw token. Lookup happens by this value.
    pub fn hash(&self, raw_token: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(raw_token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}
