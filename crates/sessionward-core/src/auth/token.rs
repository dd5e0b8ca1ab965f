//! Bearer tokens and expiry decoding.
//!
//! Access tokens are JWT-shaped: three dot-separated base64url segments
//! whose middle segment is a JSON object carrying `exp` in seconds since the
//! epoch. Signatures are never checked here; the client only needs to know
//! when the token stops being useful. A token whose expiry cannot be decoded
//! is treated as already expired.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ApiError;

/// Characters of a token shown in logs.
const REDACTED_PREFIX_LEN: usize = 8;

fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(REDACTED_PREFIX_LEN).collect();
    format!("{}…", prefix)
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(try_from = "String", into = "String")]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Result<Self, ApiError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ApiError::InvalidToken("access token is empty".to_string()));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the payload segment without verifying the signature.
    pub fn claims(&self) -> Result<Value, ApiError> {
        let mut segments = self.0.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (segments.next(), segments.next(), segments.next(), segments.next())
        else {
            return Err(ApiError::InvalidToken(
                "expected three dot-separated segments".to_string(),
            ));
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| ApiError::InvalidToken(format!("payload is not base64url: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::InvalidToken(format!("payload is not JSON: {}", e)))
    }

    pub fn expires_at(&self) -> Result<DateTime<Utc>, ApiError> {
        let claims = self.claims()?;
        let exp = claims
            .get("exp")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .ok_or_else(|| ApiError::InvalidToken("missing exp claim".to_string()))?;
        DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| ApiError::InvalidToken(format!("exp {} out of range", exp)))
    }

    /// Expiry, or `now` when it cannot be decoded.
    pub fn expires_at_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.expires_at().unwrap_or(now)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|exp| exp <= now).unwrap_or(true)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl TryFrom<String> for AccessToken {
    type Error = ApiError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AccessToken> for String {
    fn from(token: AccessToken) -> Self {
        token.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AccessToken").field(&redact(&self.0)).finish()
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(try_from = "String", into = "String")]
pub struct RefreshToken(String);

impl RefreshToken {
    pub fn new(token: impl Into<String>) -> Result<Self, ApiError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ApiError::InvalidToken("refresh token is empty".to_string()));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RefreshToken {
    type Error = ApiError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RefreshToken> for String {
    fn from(token: RefreshToken) -> Self {
        token.0
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefreshToken").field(&redact(&self.0)).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct TokenPair {
    #[serde(rename = "accessToken")]
    pub access_token: AccessToken,
    #[serde(rename = "refreshToken")]
    pub refresh_token: RefreshToken,
}

impl TokenPair {
    pub fn new(access_token: AccessToken, refresh_token: RefreshToken) -> Self {
        Self {
            access_token,
            refresh_token,
        }
    }
}

/// Anything that can supply the current access token to outgoing requests.
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Option<AccessToken>;
}

/// Build an unsigned JWT-shaped token carrying `claims`.
///
/// Used by tests and local tooling; servers issue real tokens.
pub fn encode_unsigned(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.", header, payload)
}

#[cfg(test)]
pub(crate) fn token_expiring_at(exp: i64) -> AccessToken {
    let raw = encode_unsigned(&serde_json::json!({ "sub": "user-1", "exp": exp }));
    AccessToken(format!("{}sig", raw))
}
