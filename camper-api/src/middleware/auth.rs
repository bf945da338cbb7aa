use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::typed_header::TypedHeaderRejection;
use axum_extra::TypedHeader;
use camper_core::{Caller, CallerRole};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

/// `sub` is the account id; `role` is CUSTOMER or OPERATOR.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

type BearerHeader = Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>;

fn authenticate(state: &AppState, bearer: BearerHeader) -> Result<Caller, AppError> {
    let TypedHeader(Authorization(bearer)) =
        bearer.map_err(|_| AppError::Authentication("missing bearer token".to_string()))?;

    let token_data = decode::<Claims>(
        bearer.token(),
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Authentication(format!("invalid token: {}", e)))?;

    Caller::from_claims(&token_data.claims.sub, &token_data.claims.role)
        .map_err(|e| AppError::Authentication(e.to_string()))
}

/// Resolve the bearer token into a `Caller` request extension.
pub async fn auth_middleware(
    State(state): State<AppState>,
    bearer: BearerHeader,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let caller = authenticate(&state, bearer)?;
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

pub async fn operator_middleware(
    State(state): State<AppState>,
    bearer: BearerHeader,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let caller = authenticate(&state, bearer)?;
    if !caller.is_operator() {
        return Err(camper_order::EngineError::Forbidden("operator role required".to_string()).into());
    }
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

/// Sign a token for `account_id`. Used by operator tooling and tests; end
/// users get their tokens from the identity service.
pub fn issue_token(secret: &str, account_id: &str, role: CallerRole, ttl_seconds: u64) -> Result<String, AppError> {
    let role = match role {
        CallerRole::Customer => "CUSTOMER",
        CallerRole::Operator => "OPERATOR",
    };
    let claims = Claims {
        sub: account_id.to_string(),
        role: role.to_string(),
        exp: (Utc::now() + Duration::seconds(ttl_seconds as i64)).timestamp() as usize,
    };

    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("token encoding failed: {}", e)))
}
