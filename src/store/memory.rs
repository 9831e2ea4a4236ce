//! In-process engine with the same isolation guarantees as the PostgreSQL
//! one. Stock rows get exclusive locks that live as long as the unit, and
//! staged writes become visible atomically at commit.
//!
//! Uniqueness on `(user_id, coupon_id)` behaves like a unique index: a second
//! insert of a pair held by a live unit waits for that unit to finish, then
//! fails only if the holder committed.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use crate::error::IssueError;
use crate::models::{Coupon, CouponId, CouponIssue, CouponStock, CreateCouponData, UserId};
use crate::store::{IssuanceStore, UnitOfWork};

#[derive(Default)]
struct Tables {
    last_coupon_id: CouponId,
    coupons: HashMap<CouponId, Coupon>,
    stocks: HashMap<CouponId, CouponStock>,
    issues: Vec<CouponIssue>,
    issued_pairs: HashSet<(UserId, CouponId)>,
}

type LockMap<K> = Mutex<HashMap<K, Arc<RowLock<()>>>>;

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    row_locks: LockMap<CouponId>,
    pair_locks: LockMap<(UserId, CouponId)>,
}

impl Inner {
    fn is_issued(&self, pair: &(UserId, CouponId)) -> bool {
        self.tables.lock().issued_pairs.contains(pair)
    }
}

fn lock_for<K: Eq + Hash>(locks: &LockMap<K>, key: K) -> Arc<RowLock<()>> {
    locks
        .lock()
        .entry(key)
        .or_insert_with(|| Arc::new(RowLock::new(())))
        .clone()
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_coupon(&self, data: &CreateCouponData) -> Result<Coupon, IssueError> {
        data.validate()?;

        let mut tables = self.inner.tables.lock();
        tables.last_coupon_id += 1;
        let coupon = Coupon {
            id: tables.last_coupon_id,
            name: data.name.clone(),
            issue_start_time: data.issue_start_time,
            issue_end_time: data.issue_end_time,
        };
        tables.coupons.insert(coupon.id, coupon.clone());
        Ok(coupon)
    }

    pub fn create_stock(&self, coupon_id: CouponId, quantity: i32) -> Result<CouponStock, IssueError> {
        if quantity < 0 {
            return Err(IssueError::InvalidCoupon(
                "quantity must not be negative".to_string(),
            ));
        }

        let mut tables = self.inner.tables.lock();
        if !tables.coupons.contains_key(&coupon_id) {
            return Err(IssueError::CouponNotFound);
        }
        let stock = CouponStock::new(coupon_id, quantity);
        tables.stocks.insert(coupon_id, stock.clone());
        Ok(stock)
    }

    /// Committed issuance rows for one user and coupon.
    pub fn issues_for(&self, user_id: UserId, coupon_id: CouponId) -> Vec<CouponIssue> {
        self.inner
            .tables
            .lock()
            .issues
            .iter()
            .filter(|issue| issue.user_id == user_id && issue.coupon_id == coupon_id)
            .cloned()
            .collect()
    }

    pub fn delete_all(&self) {
        *self.inner.tables.lock() = Tables::default();
        self.inner.row_locks.lock().clear();
        self.inner.pair_locks.lock().clear();
    }
}

#[async_trait]
impl IssuanceStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, IssueError> {
        Ok(Box::new(InMemoryUnit {
            inner: self.inner.clone(),
            held_rows: HashMap::new(),
            held_pairs: HashMap::new(),
            staged_stocks: HashMap::new(),
            staged_issues: Vec::new(),
        }))
    }

    async fn stock(&self, coupon_id: CouponId) -> Result<Option<CouponStock>, IssueError> {
        Ok(self.inner.tables.lock().stocks.get(&coupon_id).cloned())
    }

    async fn issued_count(&self, coupon_id: CouponId) -> Result<i64, IssueError> {
        let tables = self.inner.tables.lock();
        let count = tables
            .issues
            .iter()
            .filter(|issue| issue.coupon_id == coupon_id)
            .count();
        Ok(count as i64)
    }

    async fn ping(&self) -> Result<(), IssueError> {
        Ok(())
    }
}

struct StagedStock {
    stock: CouponStock,
    // None for writes made under the row lock.
    expected_version: Option<i64>,
}

pub struct InMemoryUnit {
    inner: Arc<Inner>,
    held_rows: HashMap<CouponId, OwnedMutexGuard<()>>,
    // Released when the unit is dropped, after commit has published the pair.
    held_pairs: HashMap<(UserId, CouponId), OwnedMutexGuard<()>>,
    staged_stocks: HashMap<CouponId, StagedStock>,
    staged_issues: Vec<CouponIssue>,
}

impl InMemoryUnit {
    fn read_stock(&self, coupon_id: CouponId) -> Option<CouponStock> {
        if let Some(staged) = self.staged_stocks.get(&coupon_id) {
            return Some(staged.stock.clone());
        }
        self.inner.tables.lock().stocks.get(&coupon_id).cloned()
    }

    fn stage_stock(
        &mut self,
        stock: &CouponStock,
        expected_version: Option<i64>,
    ) -> Result<(), IssueError> {
        {
            let tables = self.inner.tables.lock();
            let current = tables
                .stocks
                .get(&stock.coupon_id)
                .ok_or(IssueError::CouponStockNotFound)?;
            if let Some(expected) = expected_version {
                if current.version != expected {
                    return Err(IssueError::Conflict);
                }
            }
        }

        // A second write in the same unit keeps the first expectation.
        let expected_version = self
            .staged_stocks
            .get(&stock.coupon_id)
            .map_or(expected_version, |staged| staged.expected_version);

        self.staged_stocks.insert(
            stock.coupon_id,
            StagedStock {
                stock: stock.clone(),
                expected_version,
            },
        );
        Ok(())
    }

    /// Validates version expectations, then applies every staged write.
    /// Nothing is applied unless everything validates.
    fn apply(&mut self, tables: &mut Tables) -> Result<(), IssueError> {
        for (coupon_id, staged) in &self.staged_stocks {
            let current = tables
                .stocks
                .get(coupon_id)
                .ok_or(IssueError::CouponStockNotFound)?;
            if let Some(expected) = staged.expected_version {
                if current.version != expected {
                    return Err(IssueError::Conflict);
                }
            }
        }

        for (coupon_id, staged) in self.staged_stocks.drain() {
            if let Some(row) = tables.stocks.get_mut(&coupon_id) {
                row.quantity = staged.stock.quantity;
                row.version += 1;
            }
        }

        for issue in self.staged_issues.drain(..) {
            tables.issued_pairs.insert((issue.user_id, issue.coupon_id));
            tables.issues.push(issue);
        }

        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnit {
    async fn find_coupon(&mut self, coupon_id: CouponId) -> Result<Option<Coupon>, IssueError> {
        Ok(self.inner.tables.lock().coupons.get(&coupon_id).cloned())
    }

    async fn find_stock(
        &mut self,
        coupon_id: CouponId,
    ) -> Result<Option<CouponStock>, IssueError> {
        Ok(self.read_stock(coupon_id))
    }

    async fn find_stock_for_update(
        &mut self,
        coupon_id: CouponId,
    ) -> Result<Option<CouponStock>, IssueError> {
        if !self.held_rows.contains_key(&coupon_id) {
            let lock = lock_for(&self.inner.row_locks, coupon_id);
            let guard = lock.lock_owned().await;
            self.held_rows.insert(coupon_id, guard);
        }
        Ok(self.read_stock(coupon_id))
    }

    async fn save_stock(&mut self, stock: &CouponStock) -> Result<(), IssueError> {
        self.stage_stock(stock, None)
    }

    async fn save_stock_if_version(&mut self, stock: &CouponStock) -> Result<(), IssueError> {
        self.stage_stock(stock, Some(stock.version))
    }

    async fn insert_issue(&mut self, issue: &CouponIssue) -> Result<(), IssueError> {
        let pair = (issue.user_id, issue.coupon_id);
        if self.held_pairs.contains_key(&pair) || self.inner.is_issued(&pair) {
            return Err(IssueError::DuplicateIssuance);
        }

        let guard = lock_for(&self.inner.pair_locks, pair).lock_owned().await;
        // The previous holder may have committed while we waited.
        if self.inner.is_issued(&pair) {
            return Err(IssueError::DuplicateIssuance);
        }

        self.held_pairs.insert(pair, guard);
        self.staged_issues.push(issue.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), IssueError> {
        let mut this = self;
        let inner = this.inner.clone();
        let mut tables = inner.tables.lock();
        this.apply(&mut tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::time::Duration as StdDuration;

    fn seeded(quantity: i32) -> (InMemoryStore, CouponId) {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let coupon = store
            .create_coupon(&CreateCouponData {
                name: "first-come coupon".to_string(),
                issue_start_time: now,
                issue_end_time: now + Duration::minutes(5),
            })
            .unwrap();
        store.create_stock(coupon.id, quantity).unwrap();
        (store, coupon.id)
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let (store, coupon_id) = seeded(5);

        let mut unit = store.begin().await.unwrap();
        let mut stock = unit.find_stock_for_update(coupon_id).await.unwrap().unwrap();
        stock.decrease().unwrap();
        unit.save_stock(&stock).await.unwrap();
        unit.insert_issue(&CouponIssue::issue(1, coupon_id, Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.stock(coupon_id).await.unwrap().unwrap().quantity, 5);
        assert_eq!(store.issued_count(coupon_id).await.unwrap(), 0);

        unit.commit().await.unwrap();

        let stock = store.stock(coupon_id).await.unwrap().unwrap();
        assert_eq!(stock.quantity, 4);
        assert_eq!(stock.version, 1);
        assert_eq!(store.issued_count(coupon_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_unit_rolls_back_and_releases_pair() {
        let (store, coupon_id) = seeded(5);

        {
            let mut unit = store.begin().await.unwrap();
            let mut stock = unit.find_stock_for_update(coupon_id).await.unwrap().unwrap();
            stock.decrease().unwrap();
            unit.save_stock(&stock).await.unwrap();
            unit.insert_issue(&CouponIssue::issue(1, coupon_id, Utc::now()))
                .await
                .unwrap();
        }

        assert_eq!(store.stock(coupon_id).await.unwrap().unwrap().quantity, 5);

        // The pair and the row lock are both free again.
        let mut unit = store.begin().await.unwrap();
        unit.find_stock_for_update(coupon_id).await.unwrap();
        unit.insert_issue(&CouponIssue::issue(1, coupon_id, Utc::now()))
            .await
            .unwrap();
        unit.commit().await.unwrap();
        assert_eq!(store.issues_for(1, coupon_id).len(), 1);
    }

    #[tokio::test]
    async fn test_row_lock_blocks_second_unit_until_commit() {
        let (store, coupon_id) = seeded(5);

        let mut first = store.begin().await.unwrap();
        let mut stock = first.find_stock_for_update(coupon_id).await.unwrap().unwrap();

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut second = waiter_store.begin().await.unwrap();
            second
                .find_stock_for_update(coupon_id)
                .await
                .unwrap()
                .unwrap()
                .quantity
        });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        stock.decrease().unwrap();
        first.save_stock(&stock).await.unwrap();
        first.commit().await.unwrap();

        // The waiter observes the committed decrement, not its stale snapshot.
        assert_eq!(waiter.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_at_commit() {
        let (store, coupon_id) = seeded(5);

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        let mut a = first.find_stock(coupon_id).await.unwrap().unwrap();
        let mut b = second.find_stock(coupon_id).await.unwrap().unwrap();
        a.decrease().unwrap();
        b.decrease().unwrap();

        first.save_stock_if_version(&a).await.unwrap();
        second.save_stock_if_version(&b).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(IssueError::Conflict)));
        assert_eq!(store.stock(coupon_id).await.unwrap().unwrap().quantity, 4);
    }

    /// Spawns a unit that inserts `user_id` and commits, returning the first
    /// error it hits.
    fn spawn_insert(
        store: &InMemoryStore,
        user_id: UserId,
        coupon_id: CouponId,
    ) -> tokio::task::JoinHandle<Result<(), IssueError>> {
        let store = store.clone();
        tokio::spawn(async move {
            let mut unit = store.begin().await?;
            unit.insert_issue(&CouponIssue::issue(user_id, coupon_id, Utc::now()))
                .await?;
            unit.commit().await
        })
    }

    #[tokio::test]
    async fn test_concurrent_insert_waits_then_fails_on_committed_pair() {
        let (store, coupon_id) = seeded(5);

        let mut first = store.begin().await.unwrap();
        first
            .insert_issue(&CouponIssue::issue(9, coupon_id, Utc::now()))
            .await
            .unwrap();

        let second = spawn_insert(&store, 9, coupon_id);
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!second.is_finished());

        first.commit().await.unwrap();

        assert!(matches!(
            second.await.unwrap(),
            Err(IssueError::DuplicateIssuance)
        ));
        assert_eq!(store.issues_for(9, coupon_id).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_insert_succeeds_when_holder_aborts() {
        let (store, coupon_id) = seeded(5);

        // Holder of user 42 reads version 0 and stays open.
        let mut holder = store.begin().await.unwrap();
        let mut stock = holder.find_stock(coupon_id).await.unwrap().unwrap();
        stock.decrease().unwrap();
        holder.save_stock_if_version(&stock).await.unwrap();
        holder
            .insert_issue(&CouponIssue::issue(42, coupon_id, Utc::now()))
            .await
            .unwrap();

        // Another user commits first and moves the version on.
        let mut other = store.begin().await.unwrap();
        let mut stock = other.find_stock(coupon_id).await.unwrap().unwrap();
        stock.decrease().unwrap();
        other.save_stock_if_version(&stock).await.unwrap();
        other
            .insert_issue(&CouponIssue::issue(7, coupon_id, Utc::now()))
            .await
            .unwrap();
        other.commit().await.unwrap();

        let retry = spawn_insert(&store, 42, coupon_id);
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!retry.is_finished());

        assert!(matches!(holder.commit().await, Err(IssueError::Conflict)));

        retry.await.unwrap().unwrap();
        assert_eq!(store.issues_for(42, coupon_id).len(), 1);
    }

    #[tokio::test]
    async fn test_same_unit_cannot_insert_pair_twice() {
        let (store, coupon_id) = seeded(5);

        let mut unit = store.begin().await.unwrap();
        unit.insert_issue(&CouponIssue::issue(3, coupon_id, Utc::now()))
            .await
            .unwrap();
        assert!(matches!(
            unit.insert_issue(&CouponIssue::issue(3, coupon_id, Utc::now()))
                .await,
            Err(IssueError::DuplicateIssuance)
        ));
    }

    #[tokio::test]
    async fn test_delete_all_resets_tables_and_locks() {
        let (store, coupon_id) = seeded(5);

        let mut unit = store.begin().await.unwrap();
        unit.find_stock_for_update(coupon_id).await.unwrap();
        unit.insert_issue(&CouponIssue::issue(1, coupon_id, Utc::now()))
            .await
            .unwrap();
        unit.commit().await.unwrap();

        store.delete_all();

        assert!(store.inner.row_locks.lock().is_empty());
        assert!(store.inner.pair_locks.lock().is_empty());
        assert_eq!(store.issued_count(coupon_id).await.unwrap(), 0);
        assert!(store.stock(coupon_id).await.unwrap().is_none());
    }

    #[test]
    fn test_stock_requires_existing_coupon() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.create_stock(42, 10),
            Err(IssueError::CouponNotFound)
        ));
    }
}
