use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use camper_catalog::{PriceQuote, PricingInput};
use camper_core::{AccountId, Caller};
use camper_order::{
    Contract, ContractPreview, CreateOrderRequest, Order, OrderFilter, OrderStatus, OrderType, Page,
    PaymentAttempt, PaymentConfirmation, PaymentRequest, PaymentResolution,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<OrderStatus>,
    pub order_type: Option<OrderType>,
    /// Operators only; customers always see their own orders.
    pub customer_id: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/pricing/quote", post(quote))
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/payments", post(attempt_payment).get(list_payments))
        .route("/orders/{id}/payments/confirm", post(confirm_payment))
        .route("/orders/{id}/cancel", post(cancel_order))
        .route("/orders/{id}/confirm", post(confirm_order))
        .route("/orders/{id}/reject", post(reject_order))
        .route("/orders/{id}/complete", post(complete_order))
        .route("/orders/{id}/contract", post(generate_contract))
        .route("/orders/{id}/contract/preview", get(preview_contract))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/pricing/quote
async fn quote(State(state): State<AppState>, Json(input): Json<PricingInput>) -> Result<Json<PriceQuote>, AppError> {
    Ok(Json(state.engine.calculate_price(&input)?))
}

/// POST /v1/orders
async fn create_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state.engine.create_order(&caller, req).await?;
    tracing::info!("Order {} created for {}", order.id, caller.account_id);
    Ok(Json(order))
}

/// GET /v1/orders
async fn list_orders(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    let customer_id = query
        .customer_id
        .map(AccountId::new)
        .transpose()
        .map_err(|e| AppError::Validation(e.to_string()))?;
    let filter = OrderFilter {
        customer_id,
        status: query.status,
        order_type: query.order_type,
        page: Some(Page::new(query.page.unwrap_or(1), query.limit.unwrap_or(20))),
    };
    Ok(Json(state.engine.list_orders(&caller, filter).await?))
}

/// GET /v1/orders/:id
async fn get_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.engine.get_order(&caller, order_id).await?))
}

/// POST /v1/orders/:id/payments
async fn attempt_payment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<PaymentRequest>,
) -> Result<Json<PaymentResolution>, AppError> {
    Ok(Json(state.engine.attempt_payment(&caller, order_id, req).await?))
}

/// GET /v1/orders/:id/payments
async fn list_payments(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentAttempt>>, AppError> {
    Ok(Json(state.engine.payment_attempts(&caller, order_id).await?))
}

/// POST /v1/orders/:id/payments/confirm
/// Called by the client after returning from the payment channel.
async fn confirm_payment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
    body: Option<Json<PaymentConfirmation>>,
) -> Result<Json<PaymentResolution>, AppError> {
    let confirmation = body.map(|Json(c)| c).unwrap_or_default();
    Ok(Json(state.engine.confirm_payment(&caller, order_id, confirmation).await?))
}

/// POST /v1/orders/:id/cancel
async fn cancel_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
    body: Option<Json<ReasonRequest>>,
) -> Result<Json<Order>, AppError> {
    let reason = body.and_then(|Json(r)| r.reason);
    Ok(Json(state.engine.cancel_order(&caller, order_id, reason).await?))
}

/// POST /v1/orders/:id/confirm
async fn confirm_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.engine.confirm_order(&caller, order_id).await?))
}

/// POST /v1/orders/:id/reject
async fn reject_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
    body: Option<Json<ReasonRequest>>,
) -> Result<Json<Order>, AppError> {
    let reason = body.and_then(|Json(r)| r.reason);
    Ok(Json(state.engine.reject_order(&caller, order_id, reason).await?))
}

/// POST /v1/orders/:id/complete
async fn complete_order(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.engine.complete_order(&caller, order_id).await?))
}

/// POST /v1/orders/:id/contract
async fn generate_contract(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Contract>, AppError> {
    Ok(Json(state.engine.generate_contract(&caller, order_id).await?))
}

/// GET /v1/orders/:id/contract/preview
async fn preview_contract(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ContractPreview>, AppError> {
    Ok(Json(state.engine.preview_contract(&caller, order_id).await?))
}
