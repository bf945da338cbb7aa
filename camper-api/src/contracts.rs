use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use camper_core::{AccountId, Caller};
use camper_order::{Contract, SignatureArtifact, SignatureSession};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListContractsQuery {
    pub customer_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenSessionRequest {
    /// Defaults to the caller.
    pub signer_account_id: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/contracts", get(list_contracts))
        .route("/contracts/{id}", get(get_contract))
        .route("/contracts/{id}/signature-sessions", post(open_session))
        .route("/contracts/{id}/verify", post(verify_signature))
        .route("/signature-sessions/{id}/complete", post(complete_signature))
}

fn parse_account(raw: String) -> Result<AccountId, AppError> {
    AccountId::new(raw).map_err(|e| AppError::Validation(e.to_string()))
}

/// GET /v1/contracts
async fn list_contracts(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListContractsQuery>,
) -> Result<Json<Vec<Contract>>, AppError> {
    let customer_id = query.customer_id.map(parse_account).transpose()?;
    Ok(Json(state.engine.list_contracts(&caller, customer_id).await?))
}

/// GET /v1/contracts/:id
async fn get_contract(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(contract_id): Path<Uuid>,
) -> Result<Json<Contract>, AppError> {
    Ok(Json(state.engine.get_contract(&caller, contract_id).await?))
}

/// POST /v1/contracts/:id/signature-sessions
async fn open_session(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(contract_id): Path<Uuid>,
    body: Option<Json<OpenSessionRequest>>,
) -> Result<Json<SignatureSession>, AppError> {
    let signer = match body.and_then(|Json(req)| req.signer_account_id) {
        Some(raw) => parse_account(raw)?,
        None => caller.account_id.clone(),
    };
    Ok(Json(state.engine.open_signature_session(&caller, contract_id, signer).await?))
}

/// POST /v1/signature-sessions/:id/complete
/// Relayed from the e-signature provider's redirect.
async fn complete_signature(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<Uuid>,
    Json(artifact): Json<SignatureArtifact>,
) -> Result<Json<Contract>, AppError> {
    Ok(Json(state.engine.complete_signature(&caller, session_id, artifact).await?))
}

/// POST /v1/contracts/:id/verify
async fn verify_signature(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(contract_id): Path<Uuid>,
) -> Result<Json<Contract>, AppError> {
    Ok(Json(state.engine.verify_contract_signature(&caller, contract_id).await?))
}
