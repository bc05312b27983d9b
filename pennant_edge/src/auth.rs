//! Bearer-token authentication and environment binding.
//!
//! Tokens are looked up by their public prefix and verified against the
//! stored argon2 hash. Verification is deliberately expensive, so positive
//! results are held in a short-lived cache keyed by a digest of the
//! presented token; the plain secret itself is never retained. 401 means
//! the token is missing/invalid/expired; 403 means the token is real but
//! bound to a different environment or short on scope. The two are never
//! conflated.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::Utc;

use pennant_core::authoring::{EnvironmentRecord, Trust};
use pennant_core::token::{self, TokenScope};
use pennant_core::{Error, Result};

/// How long a verified token skips re-verification.
const VERIFY_CACHE_TTL: Duration = Duration::from_secs(60);

/// Minimum spacing between `last_used_at` writes for one token.
const TOUCH_INTERVAL: Duration = Duration::from_secs(10);

/// The identity attached to a request after authentication.
#[derive(Debug, Clone, Copy)]
pub struct AuthedToken {
    pub token_id: i64,
    pub env_id: i64,
    pub scope: TokenScope,
}

/// Result of authentication: the identity, plus whether the caller should
/// persist a `last_used_at` touch (touches are coalesced per token).
pub struct AuthOutcome {
    pub token: AuthedToken,
    pub needs_touch: bool,
}

struct CachedAuth {
    token: AuthedToken,
    verified_at: Instant,
}

/// Token authenticator in front of the Trust collaborator.
pub struct Authenticator {
    trust: Arc<dyn Trust>,
    verified: Mutex<HashMap<[u8; 16], CachedAuth>>,
    touches: Mutex<HashMap<i64, Instant>>,
}

impl Authenticator {
    pub fn new(trust: Arc<dyn Trust>) -> Authenticator {
        Authenticator {
            trust,
            verified: Mutex::new(HashMap::new()),
            touches: Mutex::new(HashMap::new()),
        }
    }

    /// Verify a presented bearer token. CPU-heavy on cache miss (argon2);
    /// call it off the request executor.
    pub fn authenticate(&self, bearer: &str) -> Result<AuthOutcome> {
        let prefix = token::public_prefix(bearer).ok_or(Error::Unauthorized)?;
        let digest: [u8; 16] = *md5::compute(bearer.as_bytes());

        if let Some(cached) = self.cached(&digest) {
            return Ok(AuthOutcome {
                token: cached,
                needs_touch: self.record_touch(cached.token_id),
            });
        }

        let now = Utc::now();
        let candidates = self.trust.tokens_by_prefix(prefix)?;
        for candidate in candidates {
            if !candidate.is_usable(now) {
                continue;
            }
            if token::verify_secret(bearer, &candidate.hashed_secret) {
                let authed = AuthedToken {
                    token_id: candidate.token_id,
                    env_id: candidate.env_id,
                    scope: candidate.scope,
                };
                self.verified
                    .lock()
                    .expect("thread holding auth cache lock should not panic")
                    .insert(
                        digest,
                        CachedAuth {
                            token: authed,
                            verified_at: Instant::now(),
                        },
                    );
                return Ok(AuthOutcome {
                    token: authed,
                    needs_touch: self.record_touch(authed.token_id),
                });
            }
        }

        Err(Error::Unauthorized)
    }

    /// Enforce environment binding and scope. The request's environment must
    /// be the one the token was minted for.
    pub fn authorize(
        &self,
        token: &AuthedToken,
        environment: &EnvironmentRecord,
        required: TokenScope,
    ) -> Result<()> {
        if token.env_id != environment.env_id {
            log::warn!(target: "pennant_edge",
                       token_env = token.env_id, request_env = environment.env_id;
                       "token presented against a foreign environment");
            return Err(Error::Forbidden);
        }
        if !token.scope.allows(required) {
            return Err(Error::Forbidden);
        }
        Ok(())
    }

    fn cached(&self, digest: &[u8; 16]) -> Option<AuthedToken> {
        let mut verified = self
            .verified
            .lock()
            .expect("thread holding auth cache lock should not panic");
        match verified.get(digest) {
            Some(entry) if entry.verified_at.elapsed() < VERIFY_CACHE_TTL => Some(entry.token),
            Some(_) => {
                verified.remove(digest);
                None
            }
            None => None,
        }
    }

    /// True at most once per [`TOUCH_INTERVAL`] per token.
    fn record_touch(&self, token_id: i64) -> bool {
        let mut touches = self
            .touches
            .lock()
            .expect("thread holding auth cache lock should not panic");
        let now = Instant::now();
        match touches.get(&token_id) {
            Some(last) if now.duration_since(*last) < TOUCH_INTERVAL => false,
            _ => {
                touches.insert(token_id, now);
                true
            }
        }
    }
}

/// Pull the bearer token out of `Authorization: Bearer ff_…`.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_owned())
}
