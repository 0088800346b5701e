//! Meter identifiers, tokens, and the one-time discovery of which meters a
//! token grants access to.

use crate::error::{LinkyError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_derive::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of one physical meter (the PRM, a 14 digit number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MeterId(String);

impl MeterId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bearer token for the Conso API. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        self.0.trim()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Lists the meters a token grants access to.
///
/// The token is a JWT whose `sub` claim holds either one meter identifier or
/// an array of them. Only the payload is decoded; the API checks the
/// signature on every request anyway.
pub fn list_meters(token: &AuthToken) -> Result<BTreeSet<MeterId>> {
    let parts: Vec<&str> = token.expose().split('.').collect();
    if parts.len() != 3 {
        return Err(LinkyError::auth("invalid token: not a JWT"));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| LinkyError::auth(format!("invalid token payload: {e}")))?;
    let claims: serde_json::Value = serde_json::from_slice(&payload)
        .map_err(|e| LinkyError::auth(format!("invalid token claims: {e}")))?;

    let meters: BTreeSet<MeterId> = match claims.get("sub") {
        Some(serde_json::Value::String(id)) => [MeterId::new(id.as_str())].into(),
        Some(serde_json::Value::Array(ids)) => ids
            .iter()
            .filter_map(|v| v.as_str())
            .map(MeterId::new)
            .collect(),
        _ => BTreeSet::new(),
    };

    if meters.is_empty() {
        return Err(LinkyError::auth("invalid token: no meter in subject claim"));
    }
    Ok(meters)
}

#[cfg(test)]
pub(crate) fn test_token(subject: serde_json::Value) -> AuthToken {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::json!({ "sub": subject }).to_string());
    AuthToken::new(format!("{header}.{payload}.signature"))
}
