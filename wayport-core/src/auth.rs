//! Authentication of tunnel clients
//!
//! Clients present a token in their handshake. The gateway accepts either a
//! shared static token or an HS256 JWT whose `token` claim carries the shared
//! verify token.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use wayport_common::{Result, TunnelError};

/// Constant-time comparison of two byte slices
///
/// This prevents timing attacks where an attacker could determine
/// how many bytes match based on comparison time.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Hash a token using SHA-256
#[must_use]
pub fn hash_token(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Validate token format
///
/// Returns Ok(()) if token is valid, Err with reason if not
pub fn validate_token_format(token: &str, max_len: usize) -> std::result::Result<(), TokenValidationError> {
    if token.is_empty() {
        return Err(TokenValidationError::Empty);
    }
    if token.len() > max_len {
        return Err(TokenValidationError::TooLong {
            len: token.len(),
            max: max_len,
        });
    }
    if !token.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(TokenValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Token validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenValidationError {
    #[error("token is empty")]
    Empty,
    #[error("token too long: {len} bytes exceeds maximum of {max} bytes")]
    TooLong { len: usize, max: usize },
    #[error("token contains invalid characters")]
    InvalidCharacters,
}

impl From<TokenValidationError> for TunnelError {
    fn from(err: TokenValidationError) -> Self {
        TunnelError::Authentication(err.to_string())
    }
}

/// Verifies the credential a tunnel client presents at handshake
pub trait TokenVerifier: Send + Sync + fmt::Debug {
    fn verify(&self, token: &str) -> Result<()>;
}

/// Claims carried by a tunnel JWT
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TunnelClaims {
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

/// HS256 JWT verifier
pub struct JwtVerifier {
    key: DecodingKey,
    verify_token_hash: [u8; 32],
    validation: Validation,
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl JwtVerifier {
    pub fn new(secret_key: &str, verify_token: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is honored when present but not required
        validation.required_spec_claims.clear();
        Self {
            key: DecodingKey::from_secret(secret_key.as_bytes()),
            verify_token_hash: hash_token(verify_token),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<()> {
        let data = decode::<TunnelClaims>(token, &self.key, &self.validation)
            .map_err(|e| TunnelError::Authentication(format!("invalid JWT: {e}")))?;
        if constant_time_eq(&hash_token(&data.claims.token), &self.verify_token_hash) {
            Ok(())
        } else {
            Err(TunnelError::Authentication("token claim mismatch".into()))
        }
    }
}

/// Shared static token compared in constant time
pub struct StaticTokenVerifier {
    expected_hash: [u8; 32],
}

impl fmt::Debug for StaticTokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenVerifier").finish_non_exhaustive()
    }
}

impl StaticTokenVerifier {
    pub fn new(token: &str) -> Self {
        Self {
            expected_hash: hash_token(token),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<()> {
        if constant_time_eq(&hash_token(token), &self.expected_hash) {
            Ok(())
        } else {
            Err(TunnelError::Authentication("invalid token".into()))
        }
    }
}

/// Sign a tunnel JWT for `verify_token`, optionally expiring after `ttl`
pub fn issue_token(secret_key: &str, verify_token: &str, ttl: Option<Duration>) -> Result<String> {
    let exp = ttl.map(|ttl| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_add(ttl)
            .as_secs()
    });
    let claims = TunnelClaims {
        token: verify_token.to_string(),
        exp,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret_key.as_bytes()),
    )
    .map_err(|e| TunnelError::Authentication(format!("failed to sign token: {e}")))
}
