use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};

use crate::error::IssueError;
use crate::models::CouponId;

/// Remaining quantity of a coupon. `version` is bumped on every write so the
/// optimistic ledger can detect lost updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CouponStock {
    pub coupon_id: CouponId,
    pub quantity: i32,
    pub version: i64,
}

impl CouponStock {
    pub fn new(coupon_id: CouponId, quantity: i32) -> Self {
        Self {
            coupon_id,
            quantity,
            version: 0,
        }
    }

    /// Takes exactly one unit; quantity never goes negative.
    pub fn decrease(&mut self) -> Result<(), IssueError> {
        if self.quantity <= 0 {
            return Err(IssueError::CouponOutOfStock);
        }
        self.quantity -= 1;
        Ok(())
    }

    /// Creates the stock row for a coupon
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        coupon_id: CouponId,
        quantity: i32,
    ) -> Result<Self, IssueError> {
        if quantity < 0 {
            return Err(IssueError::InvalidCoupon(
                "quantity must not be negative".to_string(),
            ));
        }

        let stock = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO coupon_stocks (coupon_id, quantity)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(coupon_id)
        .bind(quantity)
        .fetch_one(executor)
        .await?;

        Ok(stock)
    }

    /// Plain read of the stock row, no lock taken
    pub async fn find_by_coupon_id<'e, E: PgExecutor<'e>>(
        executor: E,
        coupon_id: CouponId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM coupon_stocks WHERE coupon_id = $1
            "#,
        )
        .bind(coupon_id)
        .fetch_optional(executor)
        .await
    }

    /// Reads the stock row and holds an exclusive row lock until the
    /// surrounding transaction ends
    pub async fn find_by_coupon_id_for_update<'e, E: PgExecutor<'e>>(
        executor: E,
        coupon_id: CouponId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM coupon_stocks WHERE coupon_id = $1 FOR UPDATE
            "#,
        )
        .bind(coupon_id)
        .fetch_optional(executor)
        .await
    }

    /// Writes the quantity unconditionally. Caller must hold the row lock.
    pub async fn update_quantity<'e, E: PgExecutor<'e>>(
        executor: E,
        coupon_id: CouponId,
        quantity: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE coupon_stocks
            SET quantity = $2, version = version + 1
            WHERE coupon_id = $1
            "#,
        )
        .bind(coupon_id)
        .bind(quantity)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Writes the quantity only if the row still carries `expected_version`.
    /// Returns false when another transaction got there first.
    pub async fn update_quantity_if_version<'e, E: PgExecutor<'e>>(
        executor: E,
        coupon_id: CouponId,
        quantity: i32,
        expected_version: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE coupon_stocks
            SET quantity = $2, version = version + 1
            WHERE coupon_id = $1 AND version = $3
            "#,
        )
        .bind(coupon_id)
        .bind(quantity)
        .bind(expected_version)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_all<'e, E: PgExecutor<'e>>(executor: E) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM coupon_stocks")
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }
}
