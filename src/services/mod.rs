// Services module - Business logic

pub mod issuance;
pub mod retry;
pub mod stock_ledger;

pub use issuance::{Clock, FixedClock, IssuanceTransaction, SystemClock};
pub use retry::{CouponIssueService, RetryPolicy};
pub use stock_ledger::{LockStrategy, OptimisticLedger, PessimisticLedger, StockLedger};
