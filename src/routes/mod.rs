/**
 * Routes Module
 * API route handlers
 */
use serde::Serialize;
use std::sync::Arc;

pub mod auth;
pub mod comments;
pub mod forum;
pub mod health;
pub mod profile;
pub mod reviews;

/// Success response (for delete and similar acknowledgements)
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Fetch the database pool or deny with a 503-class error.
pub(crate) fn db_pool() -> Result<Arc<sqlx::PgPool>, crate::error::AppError> {
    crate::db::get_pool().ok_or(crate::error::AppError::Unavailable)
}
