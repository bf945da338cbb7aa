use axum::{
    extract::{Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use camper_core::{Caller, ThirdPartyMethod};
use camper_order::{LedgerTransaction, Page, TransactionFilter, TransactionKind, WalletSummary};
use camper_shared::{Masked, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub kind: Option<TransactionKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RechargeRequest {
    pub amount: Money,
    pub method: ThirdPartyMethod,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub amount: Money,
    #[serde(default)]
    pub payment_password: Option<Masked<String>>,
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    pub password: Masked<String>,
    pub confirm: Masked<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPasswordRequest {
    pub password: Masked<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyPasswordResponse {
    pub valid: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/wallet", get(summary))
        .route("/wallet/transactions", get(transactions))
        .route("/wallet/recharge", post(recharge))
        .route("/wallet/withdraw", post(withdraw))
        .route("/wallet/payment-password", post(set_password))
        .route("/wallet/payment-password/verify", post(verify_password))
}

/// GET /v1/wallet
async fn summary(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<WalletSummary>, AppError> {
    Ok(Json(state.engine.wallet.summary(&caller).await?))
}

/// GET /v1/wallet/transactions
async fn transactions(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<Vec<LedgerTransaction>>, AppError> {
    let filter = TransactionFilter {
        kind: query.kind,
        since: query.since,
        until: query.until,
        page: Some(Page::new(query.page.unwrap_or(1), query.limit.unwrap_or(20))),
    };
    Ok(Json(state.engine.wallet.transactions(&caller, &filter).await?))
}

/// POST /v1/wallet/recharge
async fn recharge(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<RechargeRequest>,
) -> Result<Json<LedgerTransaction>, AppError> {
    Ok(Json(state.engine.wallet.recharge(&caller, req.amount, req.method).await?))
}

/// POST /v1/wallet/withdraw
async fn withdraw(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<WithdrawRequest>,
) -> Result<Json<LedgerTransaction>, AppError> {
    let password = req.payment_password.as_ref().map(|p| p.expose().as_str());
    Ok(Json(state.engine.wallet.withdraw(&caller, req.amount, password).await?))
}

/// POST /v1/wallet/payment-password
async fn set_password(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<SetPasswordRequest>,
) -> Result<Json<WalletSummary>, AppError> {
    state
        .engine
        .wallet
        .set_payment_password(&caller, req.password.expose(), req.confirm.expose())
        .await?;
    Ok(Json(state.engine.wallet.summary(&caller).await?))
}

/// POST /v1/wallet/payment-password/verify
async fn verify_password(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<VerifyPasswordRequest>,
) -> Result<Json<VerifyPasswordResponse>, AppError> {
    let valid = state
        .engine
        .wallet
        .verify_payment_password(&caller, req.password.expose())
        .await?;
    Ok(Json(VerifyPasswordResponse { valid }))
}
