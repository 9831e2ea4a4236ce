//! Persistence seam for issuance.
//!
//! An [`IssuanceStore`] hands out [`UnitOfWork`]s. Everything done through a
//! unit becomes visible to others only when [`UnitOfWork::commit`] succeeds;
//! dropping a unit without committing rolls it back and releases any row
//! locks it holds.

use async_trait::async_trait;

use crate::error::IssueError;
use crate::models::{Coupon, CouponId, CouponIssue, CouponStock};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgIssuanceStore;

#[async_trait]
pub trait IssuanceStore: Send + Sync {
    /// Starts a new atomic unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, IssueError>;

    /// Committed stock row, read outside of any unit.
    async fn stock(&self, coupon_id: CouponId) -> Result<Option<CouponStock>, IssueError>;

    /// Committed issuance rows for a coupon.
    async fn issued_count(&self, coupon_id: CouponId) -> Result<i64, IssueError>;

    /// Cheap reachability probe for health reporting.
    async fn ping(&self) -> Result<(), IssueError>;
}

#[async_trait]
pub trait UnitOfWork: Send {
    async fn find_coupon(&mut self, coupon_id: CouponId) -> Result<Option<Coupon>, IssueError>;

    /// Reads the stock row without locking it. The returned `version` is the
    /// one a later [`UnitOfWork::save_stock_if_version`] must match.
    async fn find_stock(&mut self, coupon_id: CouponId)
        -> Result<Option<CouponStock>, IssueError>;

    /// Reads the stock row and holds it exclusively until this unit ends.
    /// Blocks while another unit holds the same row.
    async fn find_stock_for_update(
        &mut self,
        coupon_id: CouponId,
    ) -> Result<Option<CouponStock>, IssueError>;

    /// Writes `stock.quantity` unconditionally. Only valid after
    /// [`UnitOfWork::find_stock_for_update`] on the same row.
    async fn save_stock(&mut self, stock: &CouponStock) -> Result<(), IssueError>;

    /// Writes `stock.quantity` only if the row still carries `stock.version`.
    /// A mismatch surfaces as [`IssueError::Conflict`], either here or from
    /// [`UnitOfWork::commit`] when the engine validates versions at commit.
    async fn save_stock_if_version(&mut self, stock: &CouponStock) -> Result<(), IssueError>;

    /// Inserts the issuance row. The storage uniqueness constraint on
    /// `(user_id, coupon_id)` rejects a second row with
    /// [`IssueError::DuplicateIssuance`].
    async fn insert_issue(&mut self, issue: &CouponIssue) -> Result<(), IssueError>;

    async fn commit(self: Box<Self>) -> Result<(), IssueError>;
}
