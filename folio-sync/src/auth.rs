//! Bearer token verification.
//!
//! Tokens are issued elsewhere; this module only checks them. Format:
//!
//! ```text
//! base64url(json claims) "." base64url(ed25519 signature over the first segment)
//! claims = { "sub": user id, "iat": secs, "nbf": secs (optional), "exp": secs }
//! ```

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Clock skew tolerated on `nbf` and `exp`.
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    pub exp: u64,
}

/// Who a verified token speaks for, and until when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    /// Expiry in seconds since the Unix epoch.
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("bad token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("invalid verifying key: {0}")]
    InvalidKey(String),
}

/// Checks bearer tokens and yields the caller's identity.
pub trait TokenVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verifier for ed25519-signed claim tokens.
pub struct Ed25519Verifier {
    key: VerifyingKey,
    leeway: Duration,
}

impl Ed25519Verifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self {
            key,
            leeway: DEFAULT_LEEWAY,
        }
    }

    /// Build from a standard-base64 encoded 32-byte public key.
    pub fn from_base64(encoded: &str) -> Result<Self, AuthError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key))
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Verify against an explicit clock, in seconds since the Unix epoch.
    pub fn verify_at(&self, token: &str, now: u64) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let (claims_b64, sig_b64) = token
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("expected two segments".into()))?;

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|e| AuthError::Malformed(e.to_string()))?;
        self.key
            .verify(claims_b64.as_bytes(), &signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let claims: Claims =
            serde_json::from_slice(&claims_json).map_err(|e| AuthError::Malformed(e.to_string()))?;

        if claims.sub.is_empty() {
            return Err(AuthError::Malformed("empty subject".into()));
        }
        let leeway = self.leeway.as_secs();
        if let Some(nbf) = claims.nbf {
            if now.saturating_add(leeway) < nbf {
                return Err(AuthError::NotYetValid);
            }
        }
        if claims.exp.saturating_add(leeway) <= now {
            return Err(AuthError::Expired);
        }

        Ok(Identity {
            user_id: claims.sub,
            expires_at: claims.exp,
        })
    }
}

impl TokenVerifier for Ed25519Verifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.verify_at(token, unix_now())
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Pull a token out of an `Authorization: Bearer ...` header value.
pub fn bearer_from_header(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}

/// Pull a token out of a request query string (`a=b&token=...`).
pub fn token_from_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == "token" && !value.is_empty())
        .map(|(_, value)| value)
}
