// Models module - Database entity representations

pub mod coupon;
pub mod coupon_issue;
pub mod coupon_stock;

pub use coupon::{Coupon, CreateCouponData};
pub use coupon_issue::CouponIssue;
pub use coupon_stock::CouponStock;

pub type CouponId = i64;
pub type UserId = i64;
