//! Stock decrement under contention.
//!
//! Two disciplines are available and either can back an
//! [`IssuanceTransaction`](crate::services::issuance::IssuanceTransaction):
//!
//! - [`PessimisticLedger`] locks the stock row for the rest of the unit.
//!   Concurrent callers queue behind the lock, so latency grows with
//!   contention, but a caller that gets the lock never has to retry.
//! - [`OptimisticLedger`] reads a version stamp and writes conditionally on
//!   it. Nobody blocks, but losers of a race get [`IssueError::Conflict`] and
//!   must go round again, so throughput drops as contention rises.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IssueError;
use crate::models::{CouponId, CouponStock};
use crate::store::UnitOfWork;

#[async_trait]
pub trait StockLedger: Send + Sync {
    fn strategy(&self) -> LockStrategy;

    /// Takes one unit of stock inside `unit`. Returns the stock as it will
    /// be once the unit commits.
    async fn decrement(
        &self,
        unit: &mut dyn UnitOfWork,
        coupon_id: CouponId,
    ) -> Result<CouponStock, IssueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    Pessimistic,
    Optimistic,
}

impl LockStrategy {
    pub fn ledger(self) -> Arc<dyn StockLedger> {
        match self {
            LockStrategy::Pessimistic => Arc::new(PessimisticLedger),
            LockStrategy::Optimistic => Arc::new(OptimisticLedger),
        }
    }
}

impl std::str::FromStr for LockStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pessimistic" => Ok(LockStrategy::Pessimistic),
            "optimistic" => Ok(LockStrategy::Optimistic),
            other => Err(format!("unknown lock strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PessimisticLedger;

#[async_trait]
impl StockLedger for PessimisticLedger {
    fn strategy(&self) -> LockStrategy {
        LockStrategy::Pessimistic
    }

    async fn decrement(
        &self,
        unit: &mut dyn UnitOfWork,
        coupon_id: CouponId,
    ) -> Result<CouponStock, IssueError> {
        let mut stock = unit
            .find_stock_for_update(coupon_id)
            .await?
            .ok_or(IssueError::CouponStockNotFound)?;

        stock.decrease()?;
        unit.save_stock(&stock).await?;

        Ok(stock)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OptimisticLedger;

#[async_trait]
impl StockLedger for OptimisticLedger {
    fn strategy(&self) -> LockStrategy {
        LockStrategy::Optimistic
    }

    async fn decrement(
        &self,
        unit: &mut dyn UnitOfWork,
        coupon_id: CouponId,
    ) -> Result<CouponStock, IssueError> {
        let mut stock = unit
            .find_stock(coupon_id)
            .await?
            .ok_or(IssueError::CouponStockNotFound)?;

        stock.decrease()?;
        unit.save_stock_if_version(&stock).await?;

        Ok(stock)
    }
}
