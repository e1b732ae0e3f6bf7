//! Escrow inspection and operator actions on bounties.

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Serialize;

use super::{ApiError, AppState};
use crate::payout;
use crate::types::{Amount, Bounty, BountyId, Payout};

#[derive(Debug, Serialize)]
pub struct BountyView {
    #[serde(flatten)]
    pub bounty: Bounty,
    pub confirmed_total: Amount,
    pub payouts: Vec<Payout>,
}

fn view(app_state: &AppState, bounty: Bounty) -> Result<Json<BountyView>, ApiError> {
    let store = app_state.store();
    Ok(Json(BountyView {
        confirmed_total: store.confirmed_total(&bounty.bounty_id)?,
        payouts: store.payouts_for_bounty(&bounty.bounty_id)?,
        bounty,
    }))
}

/// `GET /bounties/{id}`
pub async fn bounty_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BountyView>, ApiError> {
    let bounty = app_state.store().require_bounty(&BountyId::new(id))?;
    view(&app_state, bounty)
}

/// `POST /bounties/{id}/lock`
pub async fn lock_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BountyView>, ApiError> {
    let bounty = payout::lock_bounty(app_state.store(), &BountyId::new(id), Utc::now())?;
    view(&app_state, bounty)
}

/// `POST /bounties/{id}/refund`
pub async fn refund_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BountyView>, ApiError> {
    let bounty = payout::refund_bounty(app_state.store(), &BountyId::new(id), Utc::now())?;
    view(&app_state, bounty)
}
