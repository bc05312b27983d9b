//! Edge access tokens.
//!
//! Plain tokens are emitted exactly once at creation as `ff_<64 hex chars>`.
//! Only the public prefix (`ff_` + first 8 hex) is persisted for display and
//! lookup; the full secret is stored as an argon2 hash with a per-secret
//! salt and work factor.
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use serde::{Deserialize, Serialize};

use crate::snapshot::Timestamp;
use crate::{Error, Result};

/// `ff_` marks Pennant edge credentials on the wire.
pub const TOKEN_MARKER: &str = "ff_";

/// Length of the hex-encoded secret after the marker.
const SECRET_HEX_LEN: usize = 64;

/// Characters of the public prefix: the marker plus the first 8 hex chars.
const PREFIX_LEN: usize = TOKEN_MARKER.len() + 8;

/// Read or write access to one environment. Write implies read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum TokenScope {
    Read,
    Write,
}

impl TokenScope {
    /// Whether a token with this scope may perform an operation requiring
    /// `required`.
    pub fn allows(self, required: TokenScope) -> bool {
        match (self, required) {
            (TokenScope::Write, _) => true,
            (TokenScope::Read, TokenScope::Read) => true,
            (TokenScope::Read, TokenScope::Write) => false,
        }
    }
}

/// A token as persisted. The secret never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: i64,
    pub env_id: i64,
    pub scope: TokenScope,
    /// Argon2 hash of the full plain token.
    pub hashed_secret: String,
    /// Public display/lookup prefix.
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<Timestamp>,
}

impl TokenRecord {
    /// Active and not past its expiry.
    pub fn is_usable(&self, now: Timestamp) -> bool {
        self.is_active && !matches!(self.expires_at, Some(t) if now > t)
    }
}

/// A freshly generated token. The `token` field is shown to the operator
/// exactly once and never persisted.
#[derive(Debug, Clone)]
pub struct PlainToken {
    pub token: String,
    pub prefix: String,
}

/// Generate a new plain token: `ff_` followed by 32 random bytes hex-encoded.
pub fn generate() -> PlainToken {
    use rand::RngCore;

    let mut secret = [0u8; SECRET_HEX_LEN / 2];
    rand::thread_rng().fill_bytes(&mut secret);
    let token = format!("{TOKEN_MARKER}{}", hex::encode(secret));
    let prefix = token[..PREFIX_LEN].to_owned();
    PlainToken { token, prefix }
}

/// The public prefix of a presented token, or `None` if it doesn't even have
/// the right shape.
pub fn public_prefix(token: &str) -> Option<&str> {
    if token.len() == TOKEN_MARKER.len() + SECRET_HEX_LEN
        && token.starts_with(TOKEN_MARKER)
        && token[TOKEN_MARKER.len()..].bytes().all(|b| b.is_ascii_hexdigit())
    {
        Some(&token[..PREFIX_LEN])
    } else {
        None
    }
}

/// Hash a plain token for persistence.
pub fn hash_secret(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| Error::Internal("failed to hash token secret".to_owned()))
}

/// Verify a presented token against a stored hash.
pub fn verify_secret(token: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(token.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_have_the_wire_shape() {
        let plain = generate();
        assert_eq!(plain.token.len(), 67);
        assert!(plain.token.starts_with("ff_"));
        assert_eq!(plain.prefix.len(), 11);
        assert!(plain.token.starts_with(&plain.prefix));
        assert_eq!(public_prefix(&plain.token), Some(plain.prefix.as_str()));
    }

    #[test]
    fn prefix_rejects_malformed_tokens() {
        assert_eq!(public_prefix("ff_short"), None);
        assert_eq!(public_prefix(&format!("xx_{}", "a".repeat(64))), None);
        assert_eq!(public_prefix(&format!("ff_{}", "z".repeat(64))), None);
    }

    #[test]
    fn hash_and_verify() {
        let plain = generate();
        let hash = hash_secret(&plain.token).unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_secret(&plain.token, &hash));
        assert!(!verify_secret(&generate().token, &hash));
    }

    #[test]
    fn hashes_are_salted_per_secret() {
        let plain = generate();
        let first = hash_secret(&plain.token).unwrap();
        let second = hash_secret(&plain.token).unwrap();
        assert_ne!(first, second);
        assert!(verify_secret(&plain.token, &first));
        assert!(verify_secret(&plain.token, &second));
    }

    #[test]
    fn write_scope_implies_read() {
        assert!(TokenScope::Write.allows(TokenScope::Read));
        assert!(TokenScope::Write.allows(TokenScope::Write));
        assert!(TokenScope::Read.allows(TokenScope::Read));
        assert!(!TokenScope::Read.allows(TokenScope::Write));
    }

    #[test]
    fn expiry_and_revocation() {
        let mut record = TokenRecord {
            token_id: 1,
            env_id: 1,
            scope: TokenScope::Read,
            hashed_secret: String::new(),
            prefix: "ff_00000000".to_owned(),
            expires_at: None,
            is_active: true,
            last_used_at: None,
        };
        let now = chrono::Utc::now();
        assert!(record.is_usable(now));

        record.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(!record.is_usable(now));

        record.expires_at = None;
        record.is_active = false;
        assert!(!record.is_usable(now));
    }
}
