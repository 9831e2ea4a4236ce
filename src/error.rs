use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// SQLSTATE codes PostgreSQL raises when a transaction lost a race and
/// may succeed if simply run again.
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Error, Debug)]
pub enum IssueError {
    #[error("Coupon not found")]
    CouponNotFound,

    #[error("Coupon is not issuable at this time")]
    CouponNotIssuableTime,

    #[error("Coupon stock not found")]
    CouponStockNotFound,

    #[error("Coupon is out of stock")]
    CouponOutOfStock,

    #[error("Coupon already issued to this user")]
    DuplicateIssuance,

    #[error("Concurrent update conflict")]
    Conflict,

    #[error("Gave up after {attempts} conflicting attempts")]
    ConflictExhausted { attempts: u32 },

    #[error("Invalid coupon: {0}")]
    InvalidCoupon(String),

    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl IssueError {
    /// Only transient contention is worth another attempt; every other kind
    /// is a settled business outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IssueError::Conflict)
    }

    /// Stable machine-readable name of the kind, used in response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            IssueError::CouponNotFound => "coupon_not_found",
            IssueError::CouponNotIssuableTime => "coupon_not_issuable_time",
            IssueError::CouponStockNotFound => "coupon_stock_not_found",
            IssueError::CouponOutOfStock => "coupon_out_of_stock",
            IssueError::DuplicateIssuance => "duplicate_issuance",
            IssueError::Conflict => "conflict",
            IssueError::ConflictExhausted { .. } => "conflict_exhausted",
            IssueError::InvalidCoupon(_) => "invalid_coupon",
            IssueError::Storage(_) => "storage",
        }
    }

    /// Classifies a database error raised inside an issuance transaction.
    pub fn from_db(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return IssueError::DuplicateIssuance;
            }
            if let Some(code) = db_err.code() {
                if code == SERIALIZATION_FAILURE || code == DEADLOCK_DETECTED {
                    return IssueError::Conflict;
                }
            }
        }
        IssueError::Storage(err)
    }
}

impl IntoResponse for IssueError {
    fn into_response(self) -> Response {
        let status = match &self {
            IssueError::CouponNotFound | IssueError::CouponStockNotFound => StatusCode::NOT_FOUND,
            IssueError::CouponNotIssuableTime | IssueError::InvalidCoupon(_) => {
                StatusCode::BAD_REQUEST
            }
            IssueError::CouponOutOfStock | IssueError::DuplicateIssuance => StatusCode::CONFLICT,
            IssueError::ConflictExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            IssueError::Conflict | IssueError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            IssueError::Storage(e) => {
                tracing::error!(error = %e, "Storage failure during issuance");
                "Database error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": self.kind(),
            "message": message,
        }));

        (status, body).into_response()
    }
}
