//! JWT Authentication
//!
//! Tokens are issued by an external identity provider; this server only
//! validates them. The `sub` claim maps to a stable [`PlayerId`], so the same
//! account lands in the same seat on any instance after a reconnect.

use std::collections::HashSet;

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::state::PlayerId;
use crate::game::turn::MAX_NAME_LEN;
use crate::network::protocol::ErrorCode;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format, for providers that sign asymmetrically.
    pub public_key_pem: Option<String>,
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from `OKEY_AUTH_*` environment variables.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            issuer: var("OKEY_AUTH_ISSUER"),
            audience: var("OKEY_AUTH_AUDIENCE"),
            public_key_pem: var("OKEY_AUTH_PUBLIC_KEY_PEM"),
            secret: var("OKEY_AUTH_SECRET"),
            skip_expiry: var("OKEY_AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims read from the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Account id at the identity provider.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

/// An authenticated connection's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPlayer {
    /// Derived from `sub`
    pub player_id: PlayerId,
    /// From `name`, trimmed to the seat name limit
    pub name: String,
}

impl TokenClaims {
    /// Player id for this subject.
    pub fn player_id(&self) -> PlayerId {
        PlayerId::from_subject(&self.sub)
    }

    /// Display name, falling back to a short form of the player id.
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.chars().take(MAX_NAME_LEN).collect(),
            None => format!("player-{}", &self.player_id().to_string()[..8]),
        }
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

impl From<&AuthError> for ErrorCode {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::NotConfigured => ErrorCode::InternalError,
            _ => ErrorCode::InvalidToken,
        }
    }
}

/// Validate a JWT and extract its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (key, algorithm) = match (&config.public_key_pem, &config.secret) {
        (Some(pem), _) => {
            let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
            (key, Algorithm::RS256)
        }
        (None, Some(secret)) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
        (None, None) => return Err(AuthError::NotConfigured),
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = HashSet::new();
    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    match config.audience {
        Some(ref audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let claims = decode::<TokenClaims>(token, &key, &validation)
        .map_err(map_jwt_error)?
        .claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    // The library skips `exp` when the claim is absent or zero
    if !config.skip_expiry && claims.exp > 0 && Utc::now().timestamp() > claims.exp as i64 {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

/// Validate a token and resolve the player behind it.
pub fn authenticate(token: &str, config: &AuthConfig) -> Result<AuthenticatedPlayer, AuthError> {
    let claims = validate_token(token, config)?;
    Ok(AuthenticatedPlayer {
        player_id: claims.player_id(),
        name: claims.display_name(),
    })
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub(crate) const SECRET: &str = "okey-test-secret-0123456789abcdef";

    pub(crate) fn token_for(sub: &str, name: Option<&str>, secret: &str) -> String {
        let claims = TokenClaims {
            sub: sub.into(),
            exp: (Utc::now().timestamp() + 3600) as u64,
            name: name.map(Into::into),
            iss: Some("okey-test".into()),
            aud: None,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    pub(crate) fn hs256_config() -> AuthConfig {
        AuthConfig { secret: Some(SECRET.into()), ..Default::default() }
    }

    #[test]
    fn test_authenticate_maps_subject() {
        let token = token_for("account-7", Some("  Ayşe  "), SECRET);
        let player = authenticate(&token, &hs256_config()).unwrap();

        assert_eq!(player.player_id, PlayerId::from_subject("account-7"));
        assert_eq!(player.name, "Ayşe");

        let again = authenticate(&token_for("account-7", None, SECRET), &hs256_config()).unwrap();
        assert_eq!(again.player_id, player.player_id);
        assert!(again.name.starts_with("player-"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let claims = TokenClaims { sub: "a".into(), exp: 1, name: None, iss: None, aud: None };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        ).unwrap();

        let err = validate_token(&token, &hs256_config()).unwrap_err();
        assert!(matches!(err, AuthError::Expired));
        assert_eq!(ErrorCode::from(&err), ErrorCode::TokenExpired);

        let lenient = AuthConfig { skip_expiry: true, ..hs256_config() };
        assert!(validate_token(&token, &lenient).is_ok());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = token_for("a", None, "some-other-secret-entirely-000000");
        let result = validate_token(&token, &hs256_config());
        assert!(matches!(result, Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_missing_sub_rejected() {
        let token = token_for("", None, SECRET);
        assert!(matches!(validate_token(&token, &hs256_config()), Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_issuer_validation() {
        let token = token_for("a", None, SECRET);
        let config = AuthConfig { issuer: Some("elsewhere".into()), ..hs256_config() };
        assert!(matches!(validate_token(&token, &config), Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_long_names_truncated() {
        let long = "x".repeat(MAX_NAME_LEN + 10);
        let player = authenticate(&token_for("a", Some(&long), SECRET), &hs256_config()).unwrap();
        assert_eq!(player.name.chars().count(), MAX_NAME_LEN);
    }

    #[test]
    fn test_not_configured_error() {
        let result = validate_token("some.jwt.token", &AuthConfig::default());
        assert!(matches!(result, Err(AuthError::NotConfigured)));
    }
}
