use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::IssueError;
use crate::models::{CouponId, CouponIssue, UserId};
use crate::services::stock_ledger::StockLedger;
use crate::store::IssuanceStore;

/// Source of "now" for window checks
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// One all-or-nothing issuance attempt: load coupon, check window, take
/// stock, record issuance, commit.
#[derive(Clone)]
pub struct IssuanceTransaction {
    store: Arc<dyn IssuanceStore>,
    ledger: Arc<dyn StockLedger>,
    clock: Arc<dyn Clock>,
}

impl IssuanceTransaction {
    pub fn new(store: Arc<dyn IssuanceStore>, ledger: Arc<dyn StockLedger>) -> Self {
        Self::with_clock(store, ledger, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn IssuanceStore>,
        ledger: Arc<dyn StockLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn IssuanceStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn StockLedger> {
        &self.ledger
    }

    /// Runs a single attempt.
    ///
    /// Every early return drops the unit of work uncommitted, which rolls
    /// back the stock decrement and releases the row lock. Failure kinds
    /// from the ledger and the issuance insert pass through unchanged.
    #[tracing::instrument(
        skip(self),
        fields(strategy = ?self.ledger.strategy())
    )]
    pub async fn issue_once(
        &self,
        user_id: UserId,
        coupon_id: CouponId,
    ) -> Result<CouponIssue, IssueError> {
        let mut unit = self.store.begin().await?;

        let coupon = unit
            .find_coupon(coupon_id)
            .await?
            .ok_or(IssueError::CouponNotFound)?;

        // Read the clock inside the attempt so a retry re-checks the window.
        let now = self.clock.now();
        coupon.validate_issuable_window(now)?;

        let stock = self.ledger.decrement(&mut *unit, coupon_id).await?;
        tracing::debug!(remaining = stock.quantity, "Stock decremented");

        let issue = CouponIssue::issue(user_id, coupon_id, now);
        unit.insert_issue(&issue).await?;

        unit.commit().await?;

        tracing::debug!(issue_id = %issue.id, "Issuance committed");

        Ok(issue)
    }
}
