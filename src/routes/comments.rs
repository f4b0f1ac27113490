/**
 * Comment Routes
 * Comment creation and author-only soft deletion
 */
use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::Comment;
use crate::error::AppError;
use crate::rate_limit::{self, Decision};
use crate::routes::{db_pool, SuccessResponse};
use crate::guard;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for POST /api/forum/comments
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommentRequest {
    pub post_id: Option<Uuid>,
    pub content: Option<String>,
    pub author_id: Option<Uuid>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/forum/comments - Create a comment on a post
pub async fn create_comment(
    headers: HeaderMap,
    Json(request): Json<CreateCommentRequest>,
) -> Result<Response, AppError> {
    // Malformed-request checks run before any identity check.
    let post_id = request
        .post_id
        .ok_or_else(|| AppError::Validation("Post id is required".to_string()))?;
    let content = match request.content.as_deref().map(str::trim) {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => return Err(AppError::Validation("Content is required".to_string())),
    };
    let author_id = request
        .author_id
        .ok_or_else(|| AppError::Validation("Author id is required".to_string()))?;

    let principal = guard::require_principal(&headers)?;
    let pool = db_pool()?;

    let user = guard::require_user(pool.as_ref(), &principal).await?;
    guard::ensure_author(&user, author_id)?;

    if rate_limit::check(&user.email).await == Decision::Throttled {
        return Err(AppError::RateLimited);
    }

    let content = ammonia::clean(&content);

    let comment: Result<Comment, sqlx::Error> = sqlx::query_as(
        r#"
        INSERT INTO comments (post_id, author_id, content, published, created_at)
        VALUES ($1, $2, $3, true, now())
        RETURNING id, post_id, author_id, content, published, created_at
        "#,
    )
    .bind(post_id)
    .bind(user.id)
    .bind(&content)
    .fetch_one(pool.as_ref())
    .await;

    match comment {
        Ok(comment) => Ok((StatusCode::CREATED, Json(comment)).into_response()),
        Err(e) if e.to_string().contains("foreign key") => {
            Err(AppError::Validation("Unknown post".to_string()))
        }
        Err(e) => Err(AppError::Upstream(e)),
    }
}

/// DELETE /api/forum/comments/{id} - Soft-delete a comment.
/// The row is kept with published=false; only the author may hide it.
pub async fn delete_comment(
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let principal = guard::require_principal(&headers)?;
    let pool = db_pool()?;
    let user = guard::require_user(pool.as_ref(), &principal).await?;

    if rate_limit::check(&user.email).await == Decision::Throttled {
        return Err(AppError::RateLimited);
    }

    let comment: Option<Comment> = sqlx::query_as(
        r#"
        SELECT id, post_id, author_id, content, published, created_at
        FROM comments
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool.as_ref())
    .await?;

    let comment = comment.ok_or(AppError::NotFound)?;
    guard::ensure_author(&user, comment.author_id)?;

    sqlx::query("UPDATE comments SET published = false WHERE id = $1")
        .bind(id)
        .execute(pool.as_ref())
        .await?;

    Ok((StatusCode::OK, Json(SuccessResponse { success: true })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::{delete, post};
    use axum::Router;
    use tower::ServiceExt;

    fn comment_router() -> Router {
        Router::new()
            .route("/api/forum/comments", post(create_comment))
            .route("/api/forum/comments/{id}", delete(delete_comment))
    }

    async fn send(app: Router, req: Request<Body>) -> StatusCode {
        app.oneshot(req).await.unwrap().status()
    }

    fn create_body(request: &CreateCommentRequest) -> Request<Body> {
        Request::post("/api/forum/comments")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(request).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_comment_missing_post_returns_bad_request() {
        let status = send(
            comment_router(),
            create_body(&CreateCommentRequest {
                post_id: None,
                content: Some("Nice post".to_string()),
                author_id: Some(Uuid::new_v4()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_comment_blank_content_returns_bad_request() {
        let status = send(
            comment_router(),
            create_body(&CreateCommentRequest {
                post_id: Some(Uuid::new_v4()),
                content: Some("  ".to_string()),
                author_id: Some(Uuid::new_v4()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_comment_anonymous_returns_forbidden() {
        let status = send(
            comment_router(),
            create_body(&CreateCommentRequest {
                post_id: Some(Uuid::new_v4()),
                content: Some("Nice post".to_string()),
                author_id: Some(Uuid::new_v4()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_delete_comment_anonymous_returns_forbidden() {
        let req = Request::delete(format!("/api/forum/comments/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let status = send(comment_router(), req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
