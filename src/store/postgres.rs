use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::IssueError;
use crate::models::{Coupon, CouponId, CouponIssue, CouponStock, CreateCouponData};
use crate::store::{IssuanceStore, UnitOfWork};

/// PostgreSQL engine. Row locks come from `SELECT ... FOR UPDATE`, version
/// checks from a conditional `UPDATE`, uniqueness from the
/// `coupon_issues_user_coupon_key` constraint.
#[derive(Clone)]
pub struct PgIssuanceStore {
    pool: PgPool,
}

impl PgIssuanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_coupon(&self, data: &CreateCouponData) -> Result<Coupon, IssueError> {
        Coupon::create(&self.pool, data).await
    }

    pub async fn create_stock(
        &self,
        coupon_id: CouponId,
        quantity: i32,
    ) -> Result<CouponStock, IssueError> {
        CouponStock::create(&self.pool, coupon_id, quantity).await
    }

    /// Wipes every table. Test and admin reset only.
    pub async fn delete_all(&self) -> Result<(), IssueError> {
        let mut tx = self.pool.begin().await?;
        CouponIssue::delete_all(&mut *tx).await?;
        CouponStock::delete_all(&mut *tx).await?;
        Coupon::delete_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl IssuanceStore for PgIssuanceStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, IssueError> {
        let tx = self.pool.begin().await.map_err(IssueError::from_db)?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn stock(&self, coupon_id: CouponId) -> Result<Option<CouponStock>, IssueError> {
        Ok(CouponStock::find_by_coupon_id(&self.pool, coupon_id).await?)
    }

    async fn issued_count(&self, coupon_id: CouponId) -> Result<i64, IssueError> {
        Ok(CouponIssue::count_by_coupon(&self.pool, coupon_id).await?)
    }

    async fn ping(&self) -> Result<(), IssueError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Dropping the inner transaction without commit issues a ROLLBACK.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn find_coupon(&mut self, coupon_id: CouponId) -> Result<Option<Coupon>, IssueError> {
        Coupon::find_by_id(&mut *self.tx, coupon_id)
            .await
            .map_err(IssueError::from_db)
    }

    async fn find_stock(
        &mut self,
        coupon_id: CouponId,
    ) -> Result<Option<CouponStock>, IssueError> {
        CouponStock::find_by_coupon_id(&mut *self.tx, coupon_id)
            .await
            .map_err(IssueError::from_db)
    }

    async fn find_stock_for_update(
        &mut self,
        coupon_id: CouponId,
    ) -> Result<Option<CouponStock>, IssueError> {
        CouponStock::find_by_coupon_id_for_update(&mut *self.tx, coupon_id)
            .await
            .map_err(IssueError::from_db)
    }

    async fn save_stock(&mut self, stock: &CouponStock) -> Result<(), IssueError> {
        let updated = CouponStock::update_quantity(&mut *self.tx, stock.coupon_id, stock.quantity)
            .await
            .map_err(IssueError::from_db)?;

        if !updated {
            return Err(IssueError::CouponStockNotFound);
        }
        Ok(())
    }

    async fn save_stock_if_version(&mut self, stock: &CouponStock) -> Result<(), IssueError> {
        let updated = CouponStock::update_quantity_if_version(
            &mut *self.tx,
            stock.coupon_id,
            stock.quantity,
            stock.version,
        )
        .await
        .map_err(IssueError::from_db)?;

        if !updated {
            return Err(IssueError::Conflict);
        }
        Ok(())
    }

    async fn insert_issue(&mut self, issue: &CouponIssue) -> Result<(), IssueError> {
        issue
            .insert(&mut *self.tx)
            .await
            .map_err(IssueError::from_db)
    }

    async fn commit(self: Box<Self>) -> Result<(), IssueError> {
        self.tx.commit().await.map_err(IssueError::from_db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::issuance::IssuanceTransaction;
    use crate::services::stock_ledger::LockStrategy;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    async fn connect() -> PgIssuanceStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::db::create_pool(&url, 5, std::time::Duration::from_secs(30))
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let store = PgIssuanceStore::new(pool);
        store.delete_all().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore] // Requires a PostgreSQL database in DATABASE_URL
    async fn test_duplicate_issue_rolls_back_decrement() {
        let store = Arc::new(connect().await);
        let now = Utc::now();
        let coupon = store
            .create_coupon(&CreateCouponData {
                name: "first-come coupon".to_string(),
                issue_start_time: now - Duration::minutes(1),
                issue_end_time: now + Duration::minutes(5),
            })
            .await
            .unwrap();
        store.create_stock(coupon.id, 10).await.unwrap();

        let tx = IssuanceTransaction::new(store.clone(), LockStrategy::Pessimistic.ledger());
        tx.issue_once(1, coupon.id).await.unwrap();
        let second = tx.issue_once(1, coupon.id).await;

        assert!(matches!(second, Err(IssueError::DuplicateIssuance)));
        assert_eq!(store.issued_count(coupon.id).await.unwrap(), 1);
        assert_eq!(store.stock(coupon.id).await.unwrap().unwrap().quantity, 9);
    }
}
