//! Identity resolution and authorization checks shared by all handlers.
//!
//! A missing or invalid bearer token resolves to an anonymous identity,
//! never an error; handlers decide whether anonymity is acceptable.
//! Ownership checks compare the session-resolved email against the
//! resource owner, and author checks compare against a user row re-queried
//! by that email - client-supplied ids are never trusted directly.

use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::User;
use crate::error::AppError;

lazy_static::lazy_static! {
    /// JWT secret key from environment
    pub static ref JWT_SECRET: String = std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "default-jwt-secret-change-in-production".to_string());
}

/// Access token expiry in minutes
const ACCESS_TOKEN_EXPIRY_MINUTES: i64 = 15;

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,   // User ID
    pub email: String, // User email
    pub role: String,  // User role
    pub exp: i64,      // Expiry timestamp
    pub iat: i64,      // Issued at timestamp
}

/// The authenticated identity resolved from a session token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
}

/// Create access token
pub fn create_access_token(
    user_id: Uuid,
    email: &str,
    role: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::minutes(ACCESS_TOKEN_EXPIRY_MINUTES);

    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        role: role.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
}

/// Verify and decode access token
pub fn verify_access_token(token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(JWT_SECRET.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Resolve the request's principal from its bearer token.
/// Absence of a valid session yields `None` (anonymous), not an error.
pub fn resolve_principal(headers: &HeaderMap) -> Option<Principal> {
    let token = extract_bearer_token(headers)?;
    let claims = verify_access_token(&token).ok()?;
    let user_id = Uuid::parse_str(&claims.sub).ok()?;
    Some(Principal {
        user_id,
        email: claims.email,
        role: claims.role,
    })
}

/// Resolve a principal or deny with a 403-class error.
pub fn require_principal(headers: &HeaderMap) -> Result<Principal, AppError> {
    resolve_principal(headers)
        .ok_or_else(|| AppError::Authorization("Authentication required".to_string()))
}

/// Re-query the acting user by the session email. The row must exist and
/// be active; the claims in the token are not taken at face value.
pub async fn require_user(pool: &PgPool, principal: &Principal) -> Result<User, AppError> {
    let user: Option<User> = sqlx::query_as(
        r#"SELECT id, email, password_hash, role, is_active, created_at
           FROM users
           WHERE LOWER(email) = LOWER($1)"#,
    )
    .bind(&principal.email)
    .fetch_optional(pool)
    .await?;

    let user = user.ok_or_else(|| AppError::Authorization("Unknown account".to_string()))?;

    if !user.is_active {
        return Err(AppError::Authorization("Account is disabled".to_string()));
    }

    Ok(user)
}

/// The session email must match the resource owner's email.
pub fn ensure_owner(principal: &Principal, owner_email: &str) -> Result<(), AppError> {
    if principal.email.to_lowercase() != owner_email.to_lowercase() {
        return Err(AppError::Authorization(
            "You do not own this resource".to_string(),
        ));
    }
    Ok(())
}

/// The payload's author id must match the session-resolved user.
pub fn ensure_author(user: &User, claimed_author_id: Uuid) -> Result<(), AppError> {
    if user.id != claimed_author_id {
        return Err(AppError::Authorization(
            "Author does not match the authenticated user".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_token(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    fn test_user(id: Uuid, email: &str, active: bool) -> User {
        User {
            id,
            email: email.to_string(),
            password_hash: String::new(),
            role: "user".to_string(),
            is_active: active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_verify_access_token_invalid_returns_err() {
        let result = verify_access_token("invalid.jwt.token");
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_principal_no_header_is_anonymous() {
        let headers = HeaderMap::new();
        assert!(resolve_principal(&headers).is_none());
    }

    #[test]
    fn test_resolve_principal_garbage_token_is_anonymous() {
        let headers = headers_with_token("not-a-jwt");
        assert!(resolve_principal(&headers).is_none());
    }

    #[test]
    fn test_resolve_principal_round_trip() {
        let user_id = Uuid::new_v4();
        let token = create_access_token(user_id, "alice@example.com", "user").unwrap();
        let principal = resolve_principal(&headers_with_token(&token)).unwrap();
        assert_eq!(principal.user_id, user_id);
        assert_eq!(principal.email, "alice@example.com");
        assert_eq!(principal.role, "user");
    }

    #[test]
    fn test_ensure_owner_is_case_insensitive() {
        let principal = Principal {
            user_id: Uuid::new_v4(),
            email: "Alice@Example.com".to_string(),
            role: "user".to_string(),
        };
        assert!(ensure_owner(&principal, "alice@example.com").is_ok());
    }

    #[test]
    fn test_ensure_owner_mismatch_denied() {
        let principal = Principal {
            user_id: Uuid::new_v4(),
            email: "alice@example.com".to_string(),
            role: "user".to_string(),
        };
        let result = ensure_owner(&principal, "bob@example.com");
        assert!(matches!(result, Err(AppError::Authorization(_))));
    }

    #[test]
    fn test_ensure_author_mismatch_denied() {
        let user = test_user(Uuid::new_v4(), "alice@example.com", true);
        let result = ensure_author(&user, Uuid::new_v4());
        assert!(matches!(result, Err(AppError::Authorization(_))));
    }

    #[test]
    fn test_ensure_author_match_allowed() {
        let id = Uuid::new_v4();
        let user = test_user(id, "alice@example.com", true);
        assert!(ensure_author(&user, id).is_ok());
    }
}
