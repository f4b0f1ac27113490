/**
 * Profile Routes
 * Public profile reads, owner-only profile mutation, and role lookup
 */
use axum::{
    extract::Query,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::models::Profile;
use crate::error::AppError;
use crate::guard;
use crate::rate_limit::{self, Decision};
use crate::routes::{db_pool, SuccessResponse};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for GET /api/profile and GET /api/users/role
#[derive(Debug, Deserialize)]
pub struct EmailQuery {
    #[serde(default)]
    pub email: String,
}

/// Response for GET /api/profile - a missing profile answers `profile: null`
#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub profile: Option<ProfileBody>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileBody {
    pub email: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub website: Option<String>,
    pub language: Option<String>,
    pub theme: Option<String>,
}

/// Request body for PATCH /api/profile. `email` names the profile owner
/// and must match the session identity. Absent fields keep their stored
/// value; this endpoint cannot clear a field back to null.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub website: Option<String>,
    pub language: Option<String>,
    pub theme: Option<String>,
}

impl UpdateProfileRequest {
    fn merged_into(self, existing: Profile) -> Profile {
        Profile {
            user_id: existing.user_id,
            display_name: self.display_name.or(existing.display_name),
            bio: self.bio.or(existing.bio),
            website: self.website.or(existing.website),
            language: self.language.or(existing.language),
            theme: self.theme.or(existing.theme),
            updated_at: existing.updated_at,
        }
    }
}

/// Response for GET /api/users/role
#[derive(Debug, Serialize, Deserialize)]
pub struct RoleResponse {
    pub role: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/profile?email=... - Public profile read
pub async fn get_profile(Query(query): Query<EmailQuery>) -> Result<Response, AppError> {
    if query.email.is_empty() {
        return Err(AppError::Validation(
            "Email parameter is required".to_string(),
        ));
    }

    let pool = db_pool()?;

    let row: Option<ProfileRow> = sqlx::query_as(
        r#"
        SELECT u.email, p.display_name, p.bio, p.website, p.language, p.theme
        FROM profiles p
        JOIN users u ON u.id = p.user_id
        WHERE LOWER(u.email) = LOWER($1)
        "#,
    )
    .bind(&query.email)
    .fetch_optional(pool.as_ref())
    .await?;

    let profile = row.map(|r| ProfileBody {
        email: r.email,
        display_name: r.display_name,
        bio: r.bio,
        website: r.website,
        language: r.language,
        theme: r.theme,
    });

    Ok((StatusCode::OK, Json(ProfileResponse { profile })).into_response())
}

/// Row shape for the profile-to-user join.
#[derive(sqlx::FromRow)]
struct ProfileRow {
    email: String,
    display_name: Option<String>,
    bio: Option<String>,
    website: Option<String>,
    language: Option<String>,
    theme: Option<String>,
}

/// PATCH /api/profile - Mutate a profile. Allowed only when the session
/// email matches the owning user's email; the ownership check is made
/// before any database access so a mismatch never touches storage.
pub async fn update_profile(
    headers: HeaderMap,
    Json(request): Json<UpdateProfileRequest>,
) -> Result<Response, AppError> {
    // Malformed-request checks run before any identity check.
    let owner_email = match request.email.as_deref().map(str::trim) {
        Some(e) if !e.is_empty() => e.to_string(),
        _ => return Err(AppError::Validation("Email is required".to_string())),
    };

    let principal = guard::require_principal(&headers)?;
    guard::ensure_owner(&principal, &owner_email)?;

    let pool = db_pool()?;
    let user = guard::require_user(pool.as_ref(), &principal).await?;

    if rate_limit::check(&user.email).await == Decision::Throttled {
        return Err(AppError::RateLimited);
    }

    let existing: Option<Profile> = sqlx::query_as(
        r#"
        SELECT user_id, display_name, bio, website, language, theme, updated_at
        FROM profiles
        WHERE user_id = $1
        "#,
    )
    .bind(user.id)
    .fetch_optional(pool.as_ref())
    .await?;

    let existing = existing.ok_or(AppError::NotFound)?;
    let merged = request.merged_into(existing);

    sqlx::query(
        r#"
        UPDATE profiles
        SET display_name = $1, bio = $2, website = $3, language = $4, theme = $5, updated_at = now()
        WHERE user_id = $6
        "#,
    )
    .bind(&merged.display_name)
    .bind(&merged.bio)
    .bind(&merged.website)
    .bind(&merged.language)
    .bind(&merged.theme)
    .bind(user.id)
    .execute(pool.as_ref())
    .await?;

    Ok((StatusCode::OK, Json(SuccessResponse { success: true })).into_response())
}

/// GET /api/users/role?email=... - Role lookup, own email only
pub async fn get_role(
    headers: HeaderMap,
    Query(query): Query<EmailQuery>,
) -> Result<Response, AppError> {
    if query.email.is_empty() {
        return Err(AppError::Validation(
            "Email parameter is required".to_string(),
        ));
    }

    let principal = guard::require_principal(&headers)?;
    guard::ensure_owner(&principal, &query.email)?;

    let pool = db_pool()?;
    let user = guard::require_user(pool.as_ref(), &principal).await?;

    Ok((StatusCode::OK, Json(RoleResponse { role: user.role })).into_response())
}
