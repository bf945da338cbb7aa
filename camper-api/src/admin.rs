use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use camper_order::{Order, PaymentResolution, RechargeSettlement, RecoveryReport};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Operator-only routes; mounted behind `operator_middleware`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/recovery", post(run_recovery))
        .route("/admin/orders/{id}/reconcile", post(reconcile_order))
        .route("/admin/payments/{id}/reconcile", post(reconcile_attempt))
        .route("/admin/recharges/{id}/reconcile", post(reconcile_recharge))
}

/// POST /v1/admin/recovery
async fn run_recovery(State(state): State<AppState>) -> Json<RecoveryReport> {
    let report = state.engine.run_recovery().await;
    state.metrics.observe_recovery(&report);
    Json(report)
}

/// POST /v1/admin/orders/:id/reconcile
async fn reconcile_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.engine.payments.reconcile_order(order_id).await?))
}

/// POST /v1/admin/payments/:id/reconcile
async fn reconcile_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
) -> Result<Json<PaymentResolution>, AppError> {
    Ok(Json(state.engine.payments.reconcile_attempt(attempt_id).await?))
}

/// POST /v1/admin/recharges/:id/reconcile
async fn reconcile_recharge(
    State(state): State<AppState>,
    Path(recharge_id): Path<Uuid>,
) -> Result<Json<RechargeSettlement>, AppError> {
    Ok(Json(state.engine.wallet.reconcile_recharge(recharge_id).await?))
}
