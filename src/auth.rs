// Authentication & Authorization
// Argon2id password hashing, HS256 bearer tokens, the axum middleware that
// turns a token into an AuthContext, and the membership capability checks.

use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::contracts::MetadataStore;
use crate::errors::RagError;
use crate::models::{Role, User};

/// Bearer token prefix
const BEARER_PREFIX: &str = "Bearer ";

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hashing failed: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// JWT claims: subject is the user id, expiry is epoch seconds.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

pub fn issue_token(user_id: i64, secret: &str, ttl: Duration) -> Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: Utc::now().timestamp() + ttl.as_secs() as i64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| anyhow!("token signing failed: {e}"))
}

/// Verify a token and return the subject user id.
pub fn verify_token(token: &str, secret: &str) -> Result<i64> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| anyhow!(RagError::AuthInvalid(format!("invalid token: {e}"))))?;
    data.claims
        .sub
        .parse::<i64>()
        .map_err(|_| anyhow!(RagError::AuthInvalid("malformed subject".to_string())))
}

/// Authenticated request context, attached as a request extension.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
}

/// State the auth middleware needs.
#[derive(Clone)]
pub struct AuthState {
    pub store: Arc<dyn MetadataStore>,
    pub jwt_secret: String,
}

fn extract_bearer(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .map(|v| v.to_string())
}

/// Axum middleware: validate the bearer token, load the user, and attach an
/// [`AuthContext`]. Rejections surface as the transport error payload.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, crate::http_server::ApiError> {
    let token = extract_bearer(&request)
        .ok_or_else(|| RagError::AuthInvalid("missing bearer token".to_string()))?;

    let user_id = verify_token(&token, &state.jwt_secret)
        .map_err(|_| RagError::AuthInvalid("invalid or expired token".to_string()))?;

    let user = state
        .store
        .get_user(user_id)
        .await
        .map_err(|e| RagError::AuthInvalid(format!("user lookup failed: {e:#}")))?
        .ok_or_else(|| RagError::AuthInvalid("unknown user".to_string()))?;

    if !user.is_active {
        return Err(RagError::AuthForbidden("inactive user".to_string()).into());
    }

    debug!(user_id = user.id, "Request authenticated");
    request.extensions_mut().insert(AuthContext { user });
    Ok(next.run(request).await)
}

/// Resolve the caller's role on a knowledge base, enforcing a minimum.
/// Superusers hold every capability implicitly.
pub async fn require_role(
    store: &Arc<dyn MetadataStore>,
    user: &User,
    knowledge_id: i64,
    min_role: Role,
) -> Result<Role> {
    if user.is_superuser {
        return Ok(Role::Owner);
    }
    let role = store
        .get_role(user.id, knowledge_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("knowledge base {knowledge_id}")))?;
    if role < min_role {
        return Err(RagError::AuthForbidden(format!(
            "requires {min_role:?} on knowledge base {knowledge_id}"
        ))
        .into());
    }
    Ok(role)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_and_verify() -> Result<()> {
        let hash = hash_password("hunter2")?;
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("hunter2", "not-a-hash"));
        Ok(())
    }

    #[test]
    fn test_token_roundtrip() -> Result<()> {
        let token = issue_token(42, "secret", Duration::from_secs(60))?;
        assert_eq!(verify_token(&token, "secret")?, 42);
        Ok(())
    }

    #[test]
    fn test_token_wrong_secret_rejected() -> Result<()> {
        let token = issue_token(42, "secret", Duration::from_secs(60))?;
        assert!(verify_token(&token, "other-secret").is_err());
        Ok(())
    }

    #[test]
    fn test_expired_token_rejected() -> Result<()> {
        let claims = Claims {
            sub: "42".to_string(),
            exp: Utc::now().timestamp() - 120,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )?;
        assert!(verify_token(&token, "secret").is_err());
        Ok(())
    }
}
