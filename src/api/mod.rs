// API module - HTTP endpoints

pub mod coupons;
pub mod health;

use axum::{routing::get, Router};
use std::sync::Arc;

use crate::services::CouponIssueService;
use crate::store::IssuanceStore;

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IssuanceStore>,
    pub issuer: CouponIssueService,
}

impl AppState {
    pub fn new(issuer: CouponIssueService) -> Self {
        Self {
            store: issuer.transaction().store().clone(),
            issuer,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .merge(coupons::router())
        .with_state(state)
}
