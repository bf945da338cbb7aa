use axum::{
    http::Method,
    middleware::from_fn_with_state,
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod admin;
pub mod contracts;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod orders;
pub mod state;
pub mod wallet;
pub mod webhooks;
pub mod worker;

pub use state::{AppState, AuthConfig};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::USER_AGENT,
        ]);

    let customer = Router::new()
        .merge(orders::routes())
        .merge(contracts::routes())
        .merge(wallet::routes())
        .route_layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    let operator = admin::routes()
        .route_layer(from_fn_with_state(state.clone(), middleware::operator_middleware));

    let v1 = Router::new()
        .merge(customer)
        .merge(operator)
        .merge(webhooks::routes());

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(from_fn_with_state(state.clone(), metrics::track_metrics))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
