//! Bearer-token authorization for the HTTP surface.

use std::fmt;

use axum::http::{header, HeaderMap};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use sandbox_daemon_error::DaemonError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    User,
    Admin,
}

impl Scope {
    /// `admin` satisfies every route; `user` satisfies user routes only.
    pub fn satisfies(self, required: Scope) -> bool {
        self >= required
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::Admin => "admin",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub scope: Scope,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl AuthClaims {
    /// Claims assumed for every request when auth is disabled.
    pub fn unauthenticated_admin() -> Self {
        Self {
            sub: None,
            scope: Scope::Admin,
            exp: u64::MAX,
            iss: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
    #[error("auth is enabled but no secret is configured")]
    NotConfigured,
    #[error("scope `{required}` required, token has `{actual}`")]
    InsufficientScope { required: Scope, actual: Scope },
}

impl From<AuthError> for DaemonError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Expired => DaemonError::TokenExpired,
            AuthError::InsufficientScope { required, .. } => DaemonError::Forbidden {
                required: required.to_string(),
            },
            other => DaemonError::Unauthorized {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Clone, Default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub secret: Option<String>,
    pub issuer: Option<String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("enabled", &self.enabled)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn hs256(secret: impl Into<String>, issuer: Option<String>) -> Self {
        Self {
            enabled: true,
            secret: Some(secret.into()),
            issuer,
        }
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<AuthClaims, AuthError> {
        if !self.enabled {
            return Ok(AuthClaims::unauthenticated_admin());
        }
        let secret = self
            .secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .ok_or(AuthError::NotConfigured)?;
        let token = extract_token(headers).ok_or(AuthError::MissingToken)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        if let Some(issuer) = self.issuer.as_deref() {
            validation.set_issuer(&[issuer]);
        }
        let data = decode::<AuthClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|err| match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::InvalidToken(err.to_string()),
        })?;
        Ok(data.claims)
    }

    /// Verifies the request and checks it carries at least `required`.
    pub fn authorize(&self, headers: &HeaderMap, required: Scope) -> Result<AuthClaims, AuthError> {
        let claims = self.verify(headers)?;
        if !claims.scope.satisfies(required) {
            return Err(AuthError::InsufficientScope {
                required,
                actual: claims.scope,
            });
        }
        Ok(claims)
    }
}

fn extract_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    use super::*;

    const SECRET: &str = "test-secret";

    fn now() -> u64 {
        time::OffsetDateTime::now_utc().unix_timestamp() as u64
    }

    fn token(scope: Scope, exp: u64, iss: Option<&str>) -> String {
        let claims = AuthClaims {
            sub: Some("tester".to_string()),
            scope,
            exp,
            iss: iss.map(str::to_string),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("encode token")
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
        );
        headers
    }

    #[test]
    fn admin_satisfies_user() {
        assert!(Scope::Admin.satisfies(Scope::User));
        assert!(Scope::Admin.satisfies(Scope::Admin));
        assert!(!Scope::User.satisfies(Scope::Admin));
    }

    #[test]
    fn disabled_auth_acts_as_admin() {
        let claims = AuthConfig::disabled()
            .authorize(&HeaderMap::new(), Scope::Admin)
            .expect("authorized");
        assert_eq!(claims.scope, Scope::Admin);
    }

    #[test]
    fn valid_token_is_accepted() {
        let config = AuthConfig::hs256(SECRET, None);
        let claims = config
            .authorize(&bearer(&token(Scope::User, now() + 600, None)), Scope::User)
            .expect("authorized");
        assert_eq!(claims.sub.as_deref(), Some("tester"));
    }

    #[test]
    fn rejections_map_to_error_codes() {
        let config = AuthConfig::hs256(SECRET, Some("control-plane".to_string()));

        let missing = config.verify(&HeaderMap::new()).unwrap_err();
        assert_eq!(DaemonError::from(missing).status(), 401);

        let expired = config
            .verify(&bearer(&token(Scope::Admin, now() - 3600, Some("control-plane"))))
            .unwrap_err();
        assert!(matches!(expired, AuthError::Expired));
        assert_eq!(DaemonError::from(expired).code().as_str(), "token_expired");

        let just_expired = config
            .verify(&bearer(&token(Scope::Admin, now() - 30, Some("control-plane"))))
            .unwrap_err();
        assert!(matches!(just_expired, AuthError::Expired));
        assert_eq!(DaemonError::from(just_expired).status(), 401);

        let wrong_issuer = config
            .verify(&bearer(&token(Scope::Admin, now() + 600, Some("someone-else"))))
            .unwrap_err();
        assert!(matches!(wrong_issuer, AuthError::InvalidToken(_)));

        let forbidden = config
            .authorize(
                &bearer(&token(Scope::User, now() + 600, Some("control-plane"))),
                Scope::Admin,
            )
            .unwrap_err();
        assert_eq!(DaemonError::from(forbidden).status(), 403);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let config = AuthConfig::hs256("other-secret", None);
        let err = config
            .verify(&bearer(&token(Scope::Admin, now() + 600, None)))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }
}
