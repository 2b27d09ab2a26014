//! Credential checks for inbound notifications.
//!
//! First match wins:
//!
//! 1. `X-Signature-SHA256` (or the generic `X-Signature`): hex HMAC-SHA256
//!    over the exact request body, keyed with the shared secret.
//! 2. `X-Nextcloud-Token`: shared bearer value.
//! 3. Neither present: rejected.
//!
//! Both comparisons go through [`Mac::verify_slice`], which is constant time.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SyncError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature-sha256";
pub const GENERIC_SIGNATURE_HEADER: &str = "x-signature";
pub const TOKEN_HEADER: &str = "x-nextcloud-token";

/// Why a request was rejected. The message doubles as the HTTP `detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    InvalidSignature,
    InvalidToken,
}

impl AuthFailure {
    pub fn detail(self) -> &'static str {
        match self {
            AuthFailure::Missing => "Missing auth",
            AuthFailure::InvalidSignature => "Invalid signature",
            AuthFailure::InvalidToken => "Invalid token",
        }
    }
}

impl From<AuthFailure> for SyncError {
    fn from(failure: AuthFailure) -> Self {
        SyncError::Unauthenticated(failure.detail().to_string())
    }
}

/// Method that authenticated a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Signature,
    Token,
}

/// Verifies signatures and tokens against shared secrets.
pub struct Authenticator {
    secret: Vec<u8>,
    /// HMAC of the configured token, compared against the HMAC of the
    /// presented one so the check never short-circuits on content.
    token_tag: Vec<u8>,
}

impl Authenticator {
    pub fn new(secret: impl AsRef<[u8]>, token: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref().to_vec();
        let token_tag = tag(&secret, token.as_ref());
        Self { secret, token_tag }
    }

    /// Checks the request headers against the body.
    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<AuthMethod, AuthFailure> {
        let signature = header_str(headers, SIGNATURE_HEADER)
            .or_else(|| header_str(headers, GENERIC_SIGNATURE_HEADER));

        if let Some(signature) = signature {
            return if self.verify_signature(body, signature) {
                Ok(AuthMethod::Signature)
            } else {
                Err(AuthFailure::InvalidSignature)
            };
        }

        if let Some(token) = header_str(headers, TOKEN_HEADER) {
            return if self.verify_token(token) {
                Ok(AuthMethod::Token)
            } else {
                Err(AuthFailure::InvalidToken)
            };
        }

        Err(AuthFailure::Missing)
    }

    /// Accepts `hex` or `sha256=hex`, any letter case.
    pub fn verify_signature(&self, body: &[u8], signature: &str) -> bool {
        let hex_digest = signature.trim();
        let hex_digest = hex_digest.strip_prefix("sha256=").unwrap_or(hex_digest);
        let Ok(expected) = hex::decode(hex_digest) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }

    pub fn verify_token(&self, token: &str) -> bool {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(token.trim().as_bytes());
        mac.verify_slice(&self.token_tag).is_ok()
    }
}

/// Hex HMAC-SHA256 of `body`, as a sender would compute it.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    hex::encode(tag(secret, body))
}

fn tag(key: &[u8], data: &[u8]) -> Vec<u8> {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return Vec::new();
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}
