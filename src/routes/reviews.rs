/**
 * Review Routes
 * Product reviews: listing, creation, and author-only updates
 */
use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::Review;
use crate::error::AppError;
use crate::rate_limit::{self, Decision};
use crate::routes::db_pool;
use crate::{guard, shape};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for POST /api/reviews
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReviewRequest {
    pub product_id: Option<String>,
    pub content: Option<String>,
    pub rating: Option<i32>,
    pub author_id: Option<Uuid>,
}

/// Request body for PATCH /api/reviews/{id}
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReviewRequest {
    pub content: Option<String>,
    pub rating: Option<i32>,
    pub published: Option<bool>,
}

/// Review as shown in product listings - content trimmed for display
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSummary {
    pub id: Uuid,
    pub product_id: String,
    pub author_id: Uuid,
    pub content: String,
    pub rating: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Review> for ReviewSummary {
    fn from(review: Review) -> Self {
        Self {
            id: review.id,
            product_id: review.product_id,
            author_id: review.author_id,
            content: shape::truncate_with_ellipsis(
                &review.content,
                shape::REVIEW_SUMMARY_MAX_CHARS,
            ),
            rating: review.rating,
            created_at: review.created_at,
            updated_at: review.updated_at,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

fn is_valid_rating(rating: i32) -> bool {
    (1..=5).contains(&rating)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/reviews/{id} - Published reviews for a product; the path
/// value is the external product id.
pub async fn list_product_reviews(
    Path(product_id): Path<String>,
) -> Result<Response, AppError> {
    let pool = db_pool()?;

    let reviews: Vec<Review> = sqlx::query_as(
        r#"
        SELECT id, product_id, author_id, content, rating, published, created_at, updated_at
        FROM reviews
        WHERE product_id = $1 AND published = true
        ORDER BY created_at DESC
        "#,
    )
    .bind(&product_id)
    .fetch_all(pool.as_ref())
    .await?;

    let items: Vec<ReviewSummary> = reviews.into_iter().map(ReviewSummary::from).collect();

    Ok((StatusCode::OK, Json(items)).into_response())
}

/// POST /api/reviews - Create a review.
/// At most one review per (author, product); the rule lives here, not in
/// the schema.
pub async fn create_review(
    headers: HeaderMap,
    Json(request): Json<CreateReviewRequest>,
) -> Result<Response, AppError> {
    // Malformed-request checks run before any identity check.
    let product_id = match request.product_id.as_deref().map(str::trim) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => return Err(AppError::Validation("Product id is required".to_string())),
    };
    let content = match request.content.as_deref().map(str::trim) {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => return Err(AppError::Validation("Content is required".to_string())),
    };
    let rating = request
        .rating
        .ok_or_else(|| AppError::Validation("Rating is required".to_string()))?;
    if !is_valid_rating(rating) {
        return Err(AppError::Validation(
            "Rating must be between 1 and 5".to_string(),
        ));
    }
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

    let existing: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM reviews WHERE author_id = $1 AND product_id = $2",
    )
    .bind(user.id)
    .bind(&product_id)
    .fetch_optional(pool.as_ref())
    .await?;

    if existing.is_some() {
        return Err(AppError::Validation(
            "You have already reviewed this product".to_string(),
        ));
    }

    let content = ammonia::clean(&content);

    let review: Review = sqlx::query_as(
        r#"
        INSERT INTO reviews (product_id, author_id, content, rating, published, created_at, updated_at)
        VALUES ($1, $2, $3, $4, true, now(), now())
        RETURNING id, product_id, author_id, content, rating, published, created_at, updated_at
        "#,
    )
    .bind(&product_id)
    .bind(user.id)
    .bind(&content)
    .bind(rating)
    .fetch_one(pool.as_ref())
    .await?;

    Ok((StatusCode::CREATED, Json(review)).into_response())
}

/// PATCH /api/reviews/{id} - Update a review (author only)
pub async fn update_review(
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateReviewRequest>,
) -> Result<Response, AppError> {
    if let Some(rating) = request.rating {
        if !is_valid_rating(rating) {
            return Err(AppError::Validation(
                "Rating must be between 1 and 5".to_string(),
            ));
        }
    }
    if let Some(content) = request.content.as_deref() {
        if content.trim().is_empty() {
            return Err(AppError::Validation("Content cannot be blank".to_string()));
        }
    }

    let principal = guard::require_principal(&headers)?;
    let pool = db_pool()?;
    let user = guard::require_user(pool.as_ref(), &principal).await?;

    if rate_limit::check(&user.email).await == Decision::Throttled {
        return Err(AppError::RateLimited);
    }

    let existing: Option<Review> = sqlx::query_as(
        r#"
        SELECT id, product_id, author_id, content, rating, published, created_at, updated_at
        FROM reviews
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool.as_ref())
    .await?;

    let existing = existing.ok_or(AppError::NotFound)?;
    guard::ensure_author(&user, existing.author_id)?;

    let content = request
        .content
        .map(|c| ammonia::clean(c.trim()))
        .unwrap_or(existing.content);
    let rating = request.rating.unwrap_or(existing.rating);
    let published = request.published.unwrap_or(existing.published);

    let review: Review = sqlx::query_as(
        r#"
        UPDATE reviews
        SET content = $1, rating = $2, published = $3, updated_at = now()
        WHERE id = $4
        RETURNING id, product_id, author_id, content, rating, published, created_at, updated_at
        "#,
    )
    .bind(&content)
    .bind(rating)
    .bind(published)
    .bind(id)
    .fetch_one(pool.as_ref())
    .await?;

    Ok((StatusCode::OK, Json(review)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::{get, post};
    use axum::Router;
    use tower::ServiceExt;

    // Mirrors the app router: list and update share the {id} segment.
    fn review_router() -> Router {
        Router::new()
            .route("/api/reviews", post(create_review))
            .route(
                "/api/reviews/{id}",
                get(list_product_reviews).patch(update_review),
            )
    }

    async fn send(app: Router, req: Request<Body>) -> StatusCode {
        app.oneshot(req).await.unwrap().status()
    }

    fn create_body(request: &CreateReviewRequest) -> Request<Body> {
        Request::post("/api/reviews")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(request).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_review_missing_product_returns_bad_request() {
        let status = send(
            review_router(),
            create_body(&CreateReviewRequest {
                product_id: None,
                content: Some("Great".to_string()),
                rating: Some(5),
                author_id: Some(Uuid::new_v4()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_review_rating_out_of_range_returns_bad_request() {
        let status = send(
            review_router(),
            create_body(&CreateReviewRequest {
                product_id: Some("widget-9".to_string()),
                content: Some("Great".to_string()),
                rating: Some(6),
                author_id: Some(Uuid::new_v4()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_review_anonymous_returns_forbidden() {
        let status = send(
            review_router(),
            create_body(&CreateReviewRequest {
                product_id: Some("widget-9".to_string()),
                content: Some("Great".to_string()),
                rating: Some(4),
                author_id: Some(Uuid::new_v4()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_list_reviews_without_database_returns_unavailable() {
        let req = Request::get("/api/reviews/widget-9")
            .body(Body::empty())
            .unwrap();
        let status = send(review_router(), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_update_review_bad_rating_returns_bad_request() {
        let req = Request::patch(format!("/api/reviews/{}", Uuid::new_v4()))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&UpdateReviewRequest {
                    content: None,
                    rating: Some(0),
                    published: None,
                })
                .unwrap(),
            ))
            .unwrap();
        let status = send(review_router(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_rating_bounds() {
        assert!(is_valid_rating(1));
        assert!(is_valid_rating(5));
        assert!(!is_valid_rating(0));
        assert!(!is_valid_rating(6));
    }

    #[test]
    fn test_review_summary_truncates_content() {
        let review = Review {
            id: Uuid::new_v4(),
            product_id: "widget-9".to_string(),
            author_id: Uuid::new_v4(),
            content: "y".repeat(600),
            rating: 4,
            published: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let summary = ReviewSummary::from(review);
        assert!(summary.content.ends_with("..."));
        assert!(summary.content.chars().count() <= shape::REVIEW_SUMMARY_MAX_CHARS + 3);
    }
}
