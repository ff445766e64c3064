//! Bearer JWT authentication (HS256, `sub` = accountId).
//!
//! With no secret configured every request is let through and callers are
//! identified by the `accountId` they send.

use crate::error::ServiceError;
use actix_web::HttpRequest;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct Authenticator {
    verifier: Option<(DecodingKey, Validation)>,
}

impl Authenticator {
    pub fn new(secret: Option<&str>) -> Self {
        let verifier = secret.map(|secret| {
            (
                DecodingKey::from_secret(secret.as_bytes()),
                Validation::new(Algorithm::HS256),
            )
        });
        Self { verifier }
    }

    pub fn disabled() -> Self {
        Self { verifier: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.verifier.is_some()
    }

    /// Token subject, or `None` when authentication is disabled.
    pub fn subject(&self, req: &HttpRequest) -> Result<Option<String>, ServiceError> {
        let Some((key, validation)) = &self.verifier else {
            return Ok(None);
        };
        let token = bearer_token(req)?;
        let data = decode::<Claims>(token, key, validation)
            .map_err(|e| ServiceError::Unauthorized(format!("invalid token: {e}")))?;
        Ok(Some(data.claims.sub))
    }

    /// Require that the caller acts on its own account.
    pub fn authorize(
        &self,
        req: &HttpRequest,
        account_id: &str,
    ) -> Result<Option<String>, ServiceError> {
        let subject = self.subject(req)?;
        if let Some(sub) = &subject {
            if sub != account_id {
                return Err(ServiceError::Forbidden(format!(
                    "token subject may not act on account {account_id}"
                )));
            }
        }
        Ok(subject)
    }
}

fn bearer_token(req: &HttpRequest) -> Result<&str, ServiceError> {
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized("missing Authorization header".into()))?;
    header
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ServiceError::Unauthorized("malformed Authorization header".into()))
}
