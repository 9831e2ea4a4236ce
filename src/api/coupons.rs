use axum::{
    extract::{Path, Query, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use crate::api::AppState;
use crate::error::IssueError;
use crate::models::{CouponId, CouponIssue, UserId};

#[derive(Debug, Deserialize)]
pub struct IssueParams {
    pub user_id: UserId,
}

/// Issues one unit of a coupon to a user
async fn issue_coupon(
    State(state): State<AppState>,
    Path(coupon_id): Path<CouponId>,
    Query(params): Query<IssueParams>,
) -> Result<Json<CouponIssue>, IssueError> {
    let issue = state.issuer.issue_coupon(params.user_id, coupon_id).await?;
    Ok(Json(issue))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/coupons/:coupon_id/issue", post(issue_coupon))
}
