use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

use crate::models::{CouponId, UserId};

/// One granted coupon. `(user_id, coupon_id)` is unique in storage.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CouponIssue {
    pub id: Uuid,
    pub user_id: UserId,
    pub coupon_id: CouponId,
    pub issued_at: DateTime<Utc>,
}

impl CouponIssue {
    pub fn issue(user_id: UserId, coupon_id: CouponId, issued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            coupon_id,
            issued_at,
        }
    }

    /// Inserts the issuance row. A second row for the same pair is rejected
    /// by the `coupon_issues_user_coupon_key` unique constraint.
    pub async fn insert<'e, E: PgExecutor<'e>>(
        &self,
        executor: E,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO coupon_issues (id, user_id, coupon_id, issued_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(self.id)
        .bind(self.user_id)
        .bind(self.coupon_id)
        .bind(self.issued_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Number of coupons issued for a campaign
    pub async fn count_by_coupon<'e, E: PgExecutor<'e>>(
        executor: E,
        coupon_id: CouponId,
    ) -> Result<i64, sqlx::Error> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM coupon_issues WHERE coupon_id = $1
            "#,
        )
        .bind(coupon_id)
        .fetch_one(executor)
        .await?;

        Ok(count.0)
    }

    pub async fn delete_all<'e, E: PgExecutor<'e>>(executor: E) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM coupon_issues")
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
