//! # JWT Validation
//!
//! HMAC-signed (HS256/HS384/HS512) bearer tokens are validated with `jsonwebtoken`.
//!
//! - No `Authorization` header, or a non-bearer scheme: anonymous, not an error
//! - A bearer token that fails validation: `GatewayError::Authentication` (401)
//! - A valid token: its `sub` claim becomes the user id

use crate::core::config::AuthConfig;
use crate::core::error::{GatewayError, GatewayResult};
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Claims the gateway cares about; anything else in the token is ignored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Validates bearer tokens against a shared secret
#[derive(Clone)]
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl JwtValidator {
    pub fn new(secret: &str, algorithm: &str) -> GatewayResult<Self> {
        let algorithm = Algorithm::from_str(&algorithm.to_uppercase())
            .map_err(|_| GatewayError::config(format!("Unsupported JWT algorithm: {}", algorithm)))?;

        if !matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(GatewayError::config(format!(
                "Only HMAC JWT algorithms are supported, got {:?}",
                algorithm
            )));
        }

        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;

        Ok(Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Validator for the configured secret, or `None` when validation is off
    pub fn from_config(config: &AuthConfig) -> GatewayResult<Option<Self>> {
        config
            .jwt_secret
            .as_deref()
            .map(|secret| Self::new(secret, &config.jwt_algorithm))
            .transpose()
    }

    /// Validate a raw token and return its claims
    pub fn validate(&self, token: &str) -> GatewayResult<JwtClaims> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }

    /// User id from the request's bearer token, if it carries one
    pub fn user_id_from_headers(&self, headers: &HeaderMap) -> GatewayResult<Option<String>> {
        match bearer_token(headers)? {
            Some(token) => self.validate(token).map(|claims| Some(claims.sub)),
            None => Ok(None),
        }
    }
}

/// Extract the token from `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> GatewayResult<Option<&str>> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| GatewayError::auth("Authorization header is not valid ASCII"))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = token.trim();
            if token.is_empty() {
                Err(GatewayError::auth("Empty bearer token"))
            } else {
                Ok(Some(token))
            }
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(secret: &str, sub: &str, expires_in_seconds: i64) -> String {
        let claims = JwtClaims {
            sub: sub.to_string(),
            exp: Utc::now().timestamp() + expires_in_seconds,
            iat: Some(Utc::now().timestamp()),
            roles: vec!["guest".to_string()],
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_valid_token_yields_subject() {
        let validator = JwtValidator::new(SECRET, "HS256").unwrap();
        let headers = headers(&format!("Bearer {}", token(SECRET, "user-42", 3600)));

        assert_eq!(
            validator.user_id_from_headers(&headers).unwrap(),
            Some("user-42".to_string())
        );
    }

    #[test]
    fn test_missing_or_other_scheme_is_anonymous() {
        let validator = JwtValidator::new(SECRET, "HS256").unwrap();
        assert_eq!(validator.user_id_from_headers(&HeaderMap::new()).unwrap(), None);
        assert_eq!(
            validator.user_id_from_headers(&headers("Basic dXNlcjpwYXNz")).unwrap(),
            None
        );
    }

    #[test]
    fn test_invalid_tokens_are_rejected() {
        let validator = JwtValidator::new(SECRET, "HS256").unwrap();

        let wrong_secret = headers(&format!("Bearer {}", token("other", "u", 3600)));
        assert!(matches!(
            validator.user_id_from_headers(&wrong_secret),
            Err(GatewayError::Authentication { .. })
        ));

        let expired = headers(&format!("Bearer {}", token(SECRET, "u", -3600)));
        assert!(validator.user_id_from_headers(&expired).is_err());

        assert!(validator.user_id_from_headers(&headers("Bearer not.a.jwt")).is_err());
        assert!(validator.user_id_from_headers(&headers("Bearer ")).is_err());
    }

    #[test]
    fn test_from_config() {
        let mut config = AuthConfig::default();
        assert!(JwtValidator::from_config(&config).unwrap().is_none());

        config.jwt_secret = Some(SECRET.to_string());
        assert!(JwtValidator::from_config(&config).unwrap().is_some());

        config.jwt_algorithm = "RS256".to_string();
        assert!(JwtValidator::from_config(&config).is_err());
    }
}
