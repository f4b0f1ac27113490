/**
 * Authentication Routes
 * JWT-based authentication with register, login, verify, refresh, and logout
 */
use axum::{
    extract::ConnectInfo,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::guard::{self, create_access_token, verify_access_token};
use crate::rate_limit::{self, Decision};
use crate::{db, error::AppError};

/// Refresh token expiry in days
const REFRESH_TOKEN_EXPIRY_DAYS: i64 = 7;

// ============================================================================
// Types
// ============================================================================

/// User info returned to frontend
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: Uuid,
    pub email: String,
    pub role: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub user: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    pub user: Option<UserInfo>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub success: bool,
    pub is_valid: bool,
    pub user: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub success: bool,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Generate a random refresh token
fn generate_refresh_token() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 64)
}

/// Canonical form for stored emails. Lookups match on LOWER(email), so
/// the stored value must be lowercase or two casings of one address
/// could both register.
fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Hash a refresh token for secure storage using SHA-256.
/// Using a cryptographic hash is important because the hash is stored
/// in the database and could be a target for pre-image attacks if a
/// non-cryptographic function (e.g. DefaultHasher) were used instead.
fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/auth/register
/// Create a user account together with its (initially empty) profile row.
pub async fn register(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<RegisterRequest>,
) -> impl IntoResponse {
    let ip = addr.ip().to_string();

    // Rate limit check (keyed by IP; no session exists yet)
    if rate_limit::check(&ip).await == Decision::Throttled {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RegisterResponse {
                success: false,
                user: None,
                error: Some("Too many requests. Please try again later.".to_string()),
            }),
        );
    }

    // Validate request
    if payload.email.is_empty() || payload.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(RegisterResponse {
                success: false,
                user: None,
                error: Some("Email and password are required".to_string()),
            }),
        );
    }

    // Basic email format validation
    if !payload.email.contains('@') {
        return (
            StatusCode::BAD_REQUEST,
            Json(RegisterResponse {
                success: false,
                user: None,
                error: Some("Invalid email format".to_string()),
            }),
        );
    }

    // Password strength validation
    if payload.password.len() < 8 {
        return (
            StatusCode::BAD_REQUEST,
            Json(RegisterResponse {
                success: false,
                user: None,
                error: Some("Password must be at least 8 characters long".to_string()),
            }),
        );
    }

    // Get database pool
    let pool = match db::get_pool() {
        Some(p) => p,
        None => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(RegisterResponse {
                    success: false,
                    user: None,
                    error: Some("Database not available".to_string()),
                }),
            );
        }
    };

    // Hash password — bcrypt is intentionally CPU-intensive; run it outside
    // the async executor so it doesn't block other in-flight tasks.
    let password = payload.password.clone();
    let password_hash =
        match tokio::task::spawn_blocking(move || hash(&password, DEFAULT_COST)).await {
            Ok(Ok(h)) => h,
            Ok(Err(e)) => {
                tracing::error!("Failed to hash password: {}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(RegisterResponse {
                        success: false,
                        user: None,
                        error: Some("Failed to process password".to_string()),
                    }),
                );
            }
            Err(e) => {
                tracing::error!("spawn_blocking panic during hash: {}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(RegisterResponse {
                        success: false,
                        user: None,
                        error: Some("Failed to process password".to_string()),
                    }),
                );
            }
        };

    // Insert new user
    let email = normalize_email(&payload.email);
    let inserted: Result<(Uuid, String, String), sqlx::Error> = sqlx::query_as(
        r#"
        INSERT INTO users (email, password_hash, role, is_active, created_at)
        VALUES ($1, $2, 'user', true, now())
        RETURNING id, email, role
        "#,
    )
    .bind(&email)
    .bind(&password_hash)
    .fetch_one(pool.as_ref())
    .await;

    match inserted {
        Ok((user_id, email, role)) => {
            // Create the owned profile row. No transaction spans the two
            // inserts; a failure here leaves the user without a profile row
            // until the next profile write.
            if let Err(e) = sqlx::query(
                r#"INSERT INTO profiles (user_id, display_name, updated_at)
                   VALUES ($1, $2, now())"#,
            )
            .bind(user_id)
            .bind(&payload.display_name)
            .execute(pool.as_ref())
            .await
            {
                tracing::warn!("Failed to create profile for {}: {}", email, e);
            }

            tracing::info!("User registered successfully: {}", email);
            (
                StatusCode::CREATED,
                Json(RegisterResponse {
                    success: true,
                    user: Some(UserInfo {
                        user_id,
                        email,
                        role,
                    }),
                    error: None,
                }),
            )
        }
        Err(e) => {
            if e.to_string().contains("unique") || e.to_string().contains("duplicate key") {
                return (
                    StatusCode::CONFLICT,
                    Json(RegisterResponse {
                        success: false,
                        user: None,
                        error: Some("Email already registered".to_string()),
                    }),
                );
            }

            tracing::error!("Failed to create user: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RegisterResponse {
                    success: false,
                    user: None,
                    error: Some("Failed to create account".to_string()),
                }),
            )
        }
    }
}

/// POST /api/auth/login
/// Authenticate user and return tokens
pub async fn login(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<LoginRequest>,
) -> impl IntoResponse {
    let ip = addr.ip().to_string();

    // Rate limit check
    if rate_limit::check(&ip).await == Decision::Throttled {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(LoginResponse {
                success: false,
                user: None,
                access_token: None,
                refresh_token: None,
                error: Some("Too many requests. Please try again later.".to_string()),
            }),
        );
    }

    // Validate request
    if payload.email.is_empty() || payload.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(LoginResponse {
                success: false,
                user: None,
                access_token: None,
                refresh_token: None,
                error: Some("Email and password are required".to_string()),
            }),
        );
    }

    // Basic email format validation
    if !payload.email.contains('@') {
        return (
            StatusCode::BAD_REQUEST,
            Json(LoginResponse {
                success: false,
                user: None,
                access_token: None,
                refresh_token: None,
                error: Some("Invalid email format".to_string()),
            }),
        );
    }

    let pool = match db::get_pool() {
        Some(p) => p,
        None => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(LoginResponse {
                    success: false,
                    user: None,
                    access_token: None,
                    refresh_token: None,
                    error: Some("Database not available".to_string()),
                }),
            );
        }
    };

    let row = sqlx::query_as::<_, (Uuid, String, String, String, bool)>(
        r#"SELECT id, email, password_hash, role, is_active
           FROM users
           WHERE LOWER(email) = LOWER($1)"#,
    )
    .bind(&payload.email)
    .fetch_optional(pool.as_ref())
    .await;

    let (user_id, authenticated_email, role) = match row {
        Ok(Some((id, email, password_hash, role, is_active))) => {
            // Check account active
            if !is_active {
                return (
                    StatusCode::FORBIDDEN,
                    Json(LoginResponse {
                        success: false,
                        user: None,
                        access_token: None,
                        refresh_token: None,
                        error: Some("Account is disabled.".to_string()),
                    }),
                );
            }

            // Verify password — bcrypt is CPU-bound; keep the async executor free.
            let pwd = payload.password.clone();
            let password_ok =
                tokio::task::spawn_blocking(move || verify(&pwd, &password_hash).unwrap_or(false))
                    .await
                    .unwrap_or(false);
            if !password_ok {
                tracing::warn!("Failed login attempt for: {}", email);
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(LoginResponse {
                        success: false,
                        user: None,
                        access_token: None,
                        refresh_token: None,
                        error: Some("Invalid credentials".to_string()),
                    }),
                );
            }

            (id, email, role)
        }
        Ok(None) => {
            tracing::warn!("Login attempt for unknown user: {}", payload.email);
            return (
                StatusCode::UNAUTHORIZED,
                Json(LoginResponse {
                    success: false,
                    user: None,
                    access_token: None,
                    refresh_token: None,
                    error: Some("Invalid credentials".to_string()),
                }),
            );
        }
        Err(e) => {
            tracing::error!("Database error during login: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LoginResponse {
                    success: false,
                    user: None,
                    access_token: None,
                    refresh_token: None,
                    error: Some("Authentication service temporarily unavailable.".to_string()),
                }),
            );
        }
    };

    // Generate tokens
    let access_token = match create_access_token(user_id, &authenticated_email, &role) {
        Ok(token) => token,
        Err(e) => {
            tracing::error!("Failed to create access token: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LoginResponse {
                    success: false,
                    user: None,
                    access_token: None,
                    refresh_token: None,
                    error: Some("Failed to create token".to_string()),
                }),
            );
        }
    };

    let refresh_token = generate_refresh_token();
    let refresh_token_hash = hash_refresh_token(&refresh_token);
    let expires_at = Utc::now() + Duration::days(REFRESH_TOKEN_EXPIRY_DAYS);

    if let Err(e) = sqlx::query(
        r#"INSERT INTO refresh_tokens (user_id, token_hash, expires_at)
           VALUES ($1, $2, $3)"#,
    )
    .bind(user_id)
    .bind(&refresh_token_hash)
    .bind(expires_at)
    .execute(pool.as_ref())
    .await
    {
        tracing::error!("Failed to persist refresh token: {}", e);
    }

    tracing::info!("Successful login for user: {}", authenticated_email);

    (
        StatusCode::OK,
        Json(LoginResponse {
            success: true,
            user: Some(UserInfo {
                user_id,
                email: authenticated_email,
                role,
            }),
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            error: None,
        }),
    )
}

/// POST /api/auth/verify
/// Verify access token and return user info
pub async fn verify_token(headers: HeaderMap) -> impl IntoResponse {
    let token = match guard::extract_bearer_token(&headers) {
        Some(t) => t,
        None => {
            return (
                StatusCode::OK,
                Json(VerifyResponse {
                    success: false,
                    is_valid: false,
                    user: None,
                    error: Some("No authorization token provided".to_string()),
                }),
            );
        }
    };

    match verify_access_token(&token) {
        Ok(claims) => {
            let user_id = Uuid::parse_str(&claims.sub).unwrap_or_default();
            (
                StatusCode::OK,
                Json(VerifyResponse {
                    success: true,
                    is_valid: true,
                    user: Some(UserInfo {
                        user_id,
                        email: claims.email,
                        role: claims.role,
                    }),
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::debug!("Token verification failed: {}", e);
            (
                StatusCode::OK,
                Json(VerifyResponse {
                    success: false,
                    is_valid: false,
                    user: None,
                    error: Some("Invalid or expired token".to_string()),
                }),
            )
        }
    }
}

/// POST /api/auth/refresh
/// Refresh access token using refresh token; the old token is revoked.
pub async fn refresh(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    // Keyed by IP like the other pre-session auth endpoints.
    let ip = addr.ip().to_string();
    if rate_limit::check(&ip).await == Decision::Throttled {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(RefreshResponse {
                success: false,
                access_token: None,
                refresh_token: None,
                error: Some("Too many requests. Please try again later.".to_string()),
            }),
        ));
    }

    if payload.refresh_token.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(RefreshResponse {
                success: false,
                access_token: None,
                refresh_token: None,
                error: Some("Refresh token is required".to_string()),
            }),
        ));
    }

    let pool = super::db_pool()?;
    let token_hash = hash_refresh_token(&payload.refresh_token);
    let now = Utc::now();

    let row = sqlx::query_as::<_, (Uuid, String, String, DateTime<Utc>, bool)>(
        r#"SELECT u.id, u.email, u.role, rt.expires_at, rt.revoked
           FROM refresh_tokens rt
           JOIN users u ON u.id = rt.user_id
           WHERE rt.token_hash = $1"#,
    )
    .bind(&token_hash)
    .fetch_optional(pool.as_ref())
    .await?;

    match row {
        Some((user_id, email, role, expires_at, revoked)) if !revoked && expires_at > now => {
            let access_token = match create_access_token(user_id, &email, &role) {
                Ok(token) => token,
                Err(e) => {
                    tracing::error!("Failed to create access token: {}", e);
                    return Ok((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(RefreshResponse {
                            success: false,
                            access_token: None,
                            refresh_token: None,
                            error: Some("Failed to create token".to_string()),
                        }),
                    ));
                }
            };

            // Rotate refresh token
            let new_refresh_token = generate_refresh_token();
            let new_token_hash = hash_refresh_token(&new_refresh_token);
            let new_expires_at = now + Duration::days(REFRESH_TOKEN_EXPIRY_DAYS);

            sqlx::query("UPDATE refresh_tokens SET revoked = true WHERE token_hash = $1")
                .bind(&token_hash)
                .execute(pool.as_ref())
                .await?;

            sqlx::query(
                r#"INSERT INTO refresh_tokens (user_id, token_hash, expires_at)
                   VALUES ($1, $2, $3)"#,
            )
            .bind(user_id)
            .bind(&new_token_hash)
            .bind(new_expires_at)
            .execute(pool.as_ref())
            .await?;

            Ok((
                StatusCode::OK,
                Json(RefreshResponse {
                    success: true,
                    access_token: Some(access_token),
                    refresh_token: Some(new_refresh_token),
                    error: None,
                }),
            ))
        }
        _ => Ok((
            StatusCode::UNAUTHORIZED,
            Json(RefreshResponse {
                success: false,
                access_token: None,
                refresh_token: None,
                error: Some("Invalid or expired refresh token".to_string()),
            }),
        )),
    }
}

/// POST /api/auth/logout
/// Invalidate refresh token(s). Idempotent - always returns success.
pub async fn logout(headers: HeaderMap, Json(payload): Json<LogoutRequest>) -> impl IntoResponse {
    let pool = db::get_pool();

    // Revoke a specific refresh token if provided
    if let Some(refresh_token) = payload.refresh_token {
        let token_hash = hash_refresh_token(&refresh_token);

        if let Some(ref p) = pool {
            let _ = sqlx::query("UPDATE refresh_tokens SET revoked = true WHERE token_hash = $1")
                .bind(&token_hash)
                .execute(p.as_ref())
                .await;
        }
    }

    // If an access token is provided, revoke ALL refresh tokens for that user
    if let Some(access_token) = payload
        .access_token
        .or_else(|| guard::extract_bearer_token(&headers))
    {
        if let Ok(claims) = verify_access_token(&access_token) {
            if let (Some(ref p), Ok(user_id)) = (&pool, Uuid::parse_str(&claims.sub)) {
                let _ = sqlx::query("UPDATE refresh_tokens SET revoked = true WHERE user_id = $1")
                    .bind(user_id)
                    .execute(p.as_ref())
                    .await;
            }
        }
    }

    (StatusCode::OK, Json(LogoutResponse { success: true }))
}
