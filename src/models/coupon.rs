use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};

use crate::error::IssueError;
use crate::models::CouponId;

/// A first-come campaign. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    pub id: CouponId,
    pub name: String,
    pub issue_start_time: DateTime<Utc>,
    pub issue_end_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateCouponData {
    pub name: String,
    pub issue_start_time: DateTime<Utc>,
    pub issue_end_time: DateTime<Utc>,
}

impl CreateCouponData {
    pub fn validate(&self) -> Result<(), IssueError> {
        if self.issue_start_time > self.issue_end_time {
            return Err(IssueError::InvalidCoupon(
                "issue_start_time must not be after issue_end_time".to_string(),
            ));
        }
        Ok(())
    }
}

impl Coupon {
    /// Both window bounds are inclusive.
    pub fn validate_issuable_window(&self, now: DateTime<Utc>) -> Result<(), IssueError> {
        if now < self.issue_start_time || now > self.issue_end_time {
            return Err(IssueError::CouponNotIssuableTime);
        }
        Ok(())
    }

    /// Creates a coupon row
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        data: &CreateCouponData,
    ) -> Result<Self, IssueError> {
        data.validate()?;

        let coupon = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO coupons (name, issue_start_time, issue_end_time)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(&data.name)
        .bind(data.issue_start_time)
        .bind(data.issue_end_time)
        .fetch_one(executor)
        .await?;

        Ok(coupon)
    }

    /// Finds a coupon by ID
    pub async fn find_by_id<'e, E: PgExecutor<'e>>(
        executor: E,
        id: CouponId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM coupons WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn delete_all<'e, E: PgExecutor<'e>>(executor: E) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM coupons").execute(executor).await?;
        Ok(result.rows_affected())
    }
}
