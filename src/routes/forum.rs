/**
 * Forum Routes
 * Post listing, search, creation, and categories
 */
use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::{Category, Comment, Post};
use crate::error::AppError;
use crate::rate_limit::{self, Decision};
use crate::routes::db_pool;
use crate::{guard, shape};

/// Fixed page size for search results.
const SEARCH_PAGE_SIZE: i64 = 20;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for GET /api/forum/posts (list)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostListQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    10
}

/// Post summary (for list and search views) - content trimmed for display
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostSummary {
    pub id: Uuid,
    pub title: String,
    pub summary: String,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Post> for PostSummary {
    fn from(post: Post) -> Self {
        Self {
            id: post.id,
            title: post.title,
            summary: shape::truncate_with_ellipsis(&post.content, shape::POST_SUMMARY_MAX_CHARS),
            author_id: post.author_id,
            created_at: post.created_at,
            updated_at: post.updated_at,
        }
    }
}

/// Response for GET /api/forum/posts (list)
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostListResponse {
    pub items: Vec<PostSummary>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
}

/// Query parameters for GET /api/forum/posts/search
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub offset: i64,
}

/// Response for GET /api/forum/posts/search
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub items: Vec<PostSummary>,
    pub offset: i64,
    pub total: i64,
}

/// Request body for POST /api/forum/posts (create)
#[derive(Debug, Deserialize, Serialize)]
pub struct CreatePostRequest {
    pub payload: CreatePostPayload,
    #[serde(default)]
    pub category: Option<Uuid>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostPayload {
    pub title: Option<String>,
    pub content: Option<String>,
    pub author_id: Option<Uuid>,
}

/// Response for POST /api/forum/posts
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatePostResponse {
    pub error: Option<String>,
    pub post: Option<Post>,
}

/// Response for GET /api/forum/posts/{id} - absent posts answer `post: null`
#[derive(Debug, Serialize, Deserialize)]
pub struct PostDetailResponse {
    pub post: Option<Post>,
    pub comments: Vec<Comment>,
}

/// Request body for POST /api/forum/categories
#[derive(Debug, Deserialize, Serialize)]
pub struct CreateCategoryRequest {
    pub name: Option<String>,
}

/// Neutralize LIKE metacharacters so user input only ever matches as a
/// literal substring.
fn escape_like_pattern(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/forum/posts - List published posts with pagination
pub async fn list_posts(Query(query): Query<PostListQuery>) -> Result<Response, AppError> {
    let pool = db_pool()?;

    // Clamp page_size to max 100
    let page_size = query.page_size.clamp(1, 100);
    let page = query.page.max(1);
    let offset = (page - 1) * page_size;

    let posts: Vec<Post> = sqlx::query_as(
        r#"
        SELECT id, title, content, author_id, published, created_at, updated_at
        FROM posts
        WHERE published = true
        ORDER BY created_at DESC
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool.as_ref())
    .await?;

    let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE published = true")
        .fetch_one(pool.as_ref())
        .await?;

    let items: Vec<PostSummary> = posts.into_iter().map(PostSummary::from).collect();

    Ok((
        StatusCode::OK,
        Json(PostListResponse {
            items,
            page,
            page_size,
            total: total.0,
        }),
    )
        .into_response())
}

/// GET /api/forum/posts/search - Case-insensitive substring search over
/// title and content, published posts only.
///
/// Upstream failures degrade to an empty page rather than an error; callers
/// treat an empty result as "no result", not confirmed absence.
pub async fn search_posts(Query(query): Query<SearchQuery>) -> Result<Response, AppError> {
    if query.q.trim().is_empty() {
        return Err(AppError::Validation(
            "Search query is required".to_string(),
        ));
    }

    let pool = db_pool()?;
    let offset = query.offset.max(0);
    let pattern = format!("%{}%", escape_like_pattern(&query.q));

    let rows: Vec<Post> = sqlx::query_as(
        r#"
        SELECT id, title, content, author_id, published, created_at, updated_at
        FROM posts
        WHERE published = true AND (title ILIKE $1 OR content ILIKE $1)
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(&pattern)
    .bind(SEARCH_PAGE_SIZE)
    .bind(offset)
    .fetch_all(pool.as_ref())
    .await
    .unwrap_or_else(|e| {
        tracing::error!("Database error searching posts: {}", e);
        Vec::new()
    });

    // total reflects the fetched page, not the full match set.
    // TODO: replace with a separate COUNT query once the intended
    // pagination semantics are confirmed.
    let total = rows.len() as i64;
    let items: Vec<PostSummary> = rows.into_iter().map(PostSummary::from).collect();

    Ok((
        StatusCode::OK,
        Json(SearchResponse {
            items,
            offset,
            total,
        }),
    )
        .into_response())
}

/// GET /api/forum/posts/{id} - Single published post with its published
/// comments. A missing post answers `post: null` with status 200.
pub async fn get_post(Path(id): Path<Uuid>) -> Result<Response, AppError> {
    let pool = db_pool()?;

    let post: Option<Post> = sqlx::query_as(
        r#"
        SELECT id, title, content, author_id, published, created_at, updated_at
        FROM posts
        WHERE id = $1 AND published = true
        "#,
    )
    .bind(id)
    .fetch_optional(pool.as_ref())
    .await?;

    let post = match post {
        Some(p) => p,
        None => {
            return Ok((
                StatusCode::OK,
                Json(PostDetailResponse {
                    post: None,
                    comments: vec![],
                }),
            )
                .into_response());
        }
    };

    // Soft-deleted comments stay hidden; a comment-fetch failure degrades
    // to an empty list rather than losing the post body.
    let comments: Vec<Comment> = sqlx::query_as(
        r#"
        SELECT id, post_id, author_id, content, published, created_at
        FROM comments
        WHERE post_id = $1 AND published = true
        ORDER BY created_at ASC
        "#,
    )
    .bind(id)
    .fetch_all(pool.as_ref())
    .await
    .unwrap_or_else(|e| {
        tracing::error!("Database error fetching comments for post {}: {}", id, e);
        Vec::new()
    });

    Ok((
        StatusCode::OK,
        Json(PostDetailResponse {
            post: Some(post),
            comments,
        }),
    )
        .into_response())
}

/// POST /api/forum/posts - Create a post, optionally linked to a category
pub async fn create_post(
    headers: HeaderMap,
    Json(request): Json<CreatePostRequest>,
) -> Result<Response, AppError> {
    // Malformed-request checks run before any identity check.
    let title = match request.payload.title.as_deref().map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => return Err(AppError::Validation("Title is required".to_string())),
    };
    let content = match request.payload.content.as_deref().map(str::trim) {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => return Err(AppError::Validation("Content is required".to_string())),
    };
    let author_id = request
        .payload
        .author_id
        .ok_or_else(|| AppError::Validation("Author id is required".to_string()))?;

    let principal = guard::require_principal(&headers)?;
    let pool = db_pool()?;

    // Re-query the acting user by session email; the payload's author id
    // must match it.
    let user = guard::require_user(pool.as_ref(), &principal).await?;
    guard::ensure_author(&user, author_id)?;

    if rate_limit::check(&user.email).await == Decision::Throttled {
        return Err(AppError::RateLimited);
    }

    let content = ammonia::clean(&content);

    let post: Post = sqlx::query_as(
        r#"
        INSERT INTO posts (title, content, author_id, published, created_at, updated_at)
        VALUES ($1, $2, $3, true, now(), now())
        RETURNING id, title, content, author_id, published, created_at, updated_at
        "#,
    )
    .bind(&title)
    .bind(&content)
    .bind(user.id)
    .fetch_one(pool.as_ref())
    .await?;

    // Link the category only when one was supplied and the post insert
    // returned a row. The two inserts are not transactional: a join
    // failure leaves the post in place and is logged, not surfaced.
    if let Some(category_id) = request.category {
        if let Err(e) = sqlx::query(
            r#"INSERT INTO post_categories (post_id, category_id) VALUES ($1, $2)"#,
        )
        .bind(post.id)
        .bind(category_id)
        .execute(pool.as_ref())
        .await
        {
            tracing::error!(
                "Failed to link post {} to category {}: {}",
                post.id,
                category_id,
                e
            );
        }
    }

    Ok((
        StatusCode::CREATED,
        Json(CreatePostResponse {
            error: None,
            post: Some(post),
        }),
    )
        .into_response())
}

/// GET /api/forum/categories - List all categories
pub async fn list_categories() -> Result<Response, AppError> {
    let pool = db_pool()?;

    let categories: Vec<Category> =
        sqlx::query_as("SELECT id, name, created_at FROM categories ORDER BY name ASC")
            .fetch_all(pool.as_ref())
            .await?;

    Ok((StatusCode::OK, Json(categories)).into_response())
}

/// POST /api/forum/categories - Create a category (auth required)
pub async fn create_category(
    headers: HeaderMap,
    Json(request): Json<CreateCategoryRequest>,
) -> Result<Response, AppError> {
    let name = match request.name.as_deref().map(str::trim) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => return Err(AppError::Validation("Name is required".to_string())),
    };

    let principal = guard::require_principal(&headers)?;
    let pool = db_pool()?;
    let user = guard::require_user(pool.as_ref(), &principal).await?;

    if rate_limit::check(&user.email).await == Decision::Throttled {
        return Err(AppError::RateLimited);
    }

    let category: Result<Category, sqlx::Error> = sqlx::query_as(
        r#"
        INSERT INTO categories (name, created_at)
        VALUES ($1, now())
        RETURNING id, name, created_at
        "#,
    )
    .bind(&name)
    .fetch_one(pool.as_ref())
    .await;

    match category {
        Ok(category) => Ok((StatusCode::CREATED, Json(category)).into_response()),
        Err(e)
            if e.to_string().contains("duplicate key")
                || e.to_string().contains("unique constraint") =>
        {
            Err(AppError::Conflict("Category already exists".to_string()))
        }
        Err(e) => Err(AppError::Upstream(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn forum_router() -> Router {
        Router::new()
            .route("/api/forum/posts", get(list_posts).post(create_post))
            .route("/api/forum/posts/search", get(search_posts))
            .route("/api/forum/posts/{id}", get(get_post))
            .route(
                "/api/forum/categories",
                get(list_categories).post(create_category),
            )
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, axum::body::Bytes) {
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes)
    }

    fn post_body(request: &CreatePostRequest) -> Request<Body> {
        Request::post("/api/forum/posts")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(request).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_post_missing_title_returns_bad_request() {
        let request = CreatePostRequest {
            payload: CreatePostPayload {
                title: None,
                content: Some("Body".to_string()),
                author_id: Some(Uuid::new_v4()),
            },
            category: None,
        };
        let (status, _) = send(forum_router(), post_body(&request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_post_blank_content_returns_bad_request() {
        let request = CreatePostRequest {
            payload: CreatePostPayload {
                title: Some("Hi".to_string()),
                content: Some("   ".to_string()),
                author_id: Some(Uuid::new_v4()),
            },
            category: None,
        };
        let (status, _) = send(forum_router(), post_body(&request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_post_missing_author_returns_bad_request() {
        let request = CreatePostRequest {
            payload: CreatePostPayload {
                title: Some("Hi".to_string()),
                content: Some("Body".to_string()),
                author_id: None,
            },
            category: None,
        };
        let (status, _) = send(forum_router(), post_body(&request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_post_anonymous_returns_forbidden() {
        // Validation passes; the anonymous principal is rejected before any
        // database access.
        let request = CreatePostRequest {
            payload: CreatePostPayload {
                title: Some("Hi".to_string()),
                content: Some("Body".to_string()),
                author_id: Some(Uuid::new_v4()),
            },
            category: None,
        };
        let (status, _) = send(forum_router(), post_body(&request)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_search_empty_query_returns_bad_request() {
        let req = Request::get("/api/forum/posts/search?q=")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(forum_router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_search_without_database_returns_unavailable() {
        let req = Request::get("/api/forum/posts/search?q=hello")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(forum_router(), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_get_post_invalid_uuid_returns_bad_request() {
        let req = Request::get("/api/forum/posts/not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(forum_router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_category_missing_name_returns_bad_request() {
        let req = Request::post("/api/forum/categories")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&CreateCategoryRequest { name: None }).unwrap(),
            ))
            .unwrap();
        let (status, _) = send(forum_router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_escape_like_pattern_neutralizes_wildcards() {
        assert_eq!(escape_like_pattern("50% off"), "50\\% off");
        assert_eq!(escape_like_pattern("snake_case"), "snake\\_case");
        assert_eq!(escape_like_pattern("back\\slash"), "back\\\\slash");
        assert_eq!(escape_like_pattern("plain"), "plain");
    }

    #[test]
    fn test_post_summary_truncates_content() {
        let post = Post {
            id: Uuid::new_v4(),
            title: "Hi".to_string(),
            content: "x".repeat(500),
            author_id: Uuid::new_v4(),
            published: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let summary = PostSummary::from(post);
        assert!(summary.summary.ends_with("..."));
        assert!(summary.summary.chars().count() <= shape::POST_SUMMARY_MAX_CHARS + 3);
    }
}
