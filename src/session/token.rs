//! HS256 JSON Web Tokens.
//!
//! `header.claims.signature`, each part base64url without padding, the
//! signature an HMAC-SHA256 over `header.claims`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::TokenError;

type HmacSha256 = Hmac<Sha256>;

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;
const MAX_TOKEN_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// Expiry saturates at the latest representable instant.
    pub fn new(user_id: i64, email: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        let exp = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            sub: user_id,
            email: email.into(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

fn mac(secret: &[u8]) -> Result<HmacSha256, TokenError> {
    HmacSha256::new_from_slice(secret).map_err(|e| TokenError::Malformed(e.to_string()))
}

pub fn issue(claims: &Claims, secret: &[u8]) -> Result<String, TokenError> {
    let claims_json =
        serde_json::to_vec(claims).map_err(|e| TokenError::Malformed(e.to_string()))?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(HEADER),
        URL_SAFE_NO_PAD.encode(claims_json)
    );
    let mut mac = mac(secret)?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{}.{}", signing_input, signature))
}

/// Check signature and expiry. Used by the backend.
pub fn verify(token: &str, secret: &[u8], now: DateTime<Utc>) -> Result<Claims, TokenError> {
    let (signing_input, signature) = token
        .rsplit_once('.')
        .ok_or_else(|| TokenError::Malformed("expected three segments".into()))?;
    let claims = inspect(token)?;

    let expected = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    let mut mac = mac(secret)?;
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| TokenError::BadSignature)?;

    if claims.is_expired_at(now) {
        return Err(TokenError::Expired { exp: claims.exp });
    }
    Ok(claims)
}

/// Decode the claims without checking the signature.
///
/// Good enough to decide what the UI shows; never an authorization check.
pub fn inspect(token: &str) -> Result<Claims, TokenError> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(TokenError::Malformed("token too long".into()));
    }
    let parts: Vec<&str> = token.split('.').collect();
    let [header, claims, _signature] = parts.as_slice() else {
        return Err(TokenError::Malformed("expected three segments".into()));
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| TokenError::Malformed(format!("header: {}", e)))?;
    let header: serde_json::Value = serde_json::from_slice(&header_bytes)
        .map_err(|e| TokenError::Malformed(format!("header: {}", e)))?;
    if header.get("alg").and_then(|a| a.as_str()) != Some("HS256") {
        return Err(TokenError::Malformed("unsupported algorithm".into()));
    }

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims)
        .map_err(|e| TokenError::Malformed(format!("claims: {}", e)))?;
    serde_json::from_slice(&claims_bytes).map_err(|e| TokenError::Malformed(format!("claims: {}", e)))
}
