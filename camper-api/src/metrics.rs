use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use camper_order::RecoveryReport;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::state::AppState;

pub struct Metrics {
    registry: Registry,
    http_requests: IntCounterVec,
    recovery_attempts: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let http_requests = IntCounterVec::new(
            Opts::new("camper_http_requests_total", "HTTP requests by method and status"),
            &["method", "status"],
        )?;
        let recovery_attempts = IntCounterVec::new(
            Opts::new("camper_recovery_attempts_total", "Payment attempts handled by the recovery pass"),
            &["outcome"],
        )?;
        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(recovery_attempts.clone()))?;

        Ok(Self { registry, http_requests, recovery_attempts })
    }

    pub fn observe_recovery(&self, report: &RecoveryReport) {
        for (outcome, count) in [
            ("resolved", report.resolved.len()),
            ("compensated", report.compensated.len()),
            ("unresolved", report.unresolved.len()),
            ("recharge_credited", report.recharges_credited.len()),
            ("recharge_failed", report.recharges_failed.len()),
            ("recharge_unresolved", report.recharges_unresolved.len()),
            ("refund_settled", report.refunds_settled.len()),
            ("error", report.errors.len()),
        ] {
            self.recovery_attempts.with_label_values(&[outcome]).inc_by(count as u64);
        }
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub async fn track_metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let response = next.run(req).await;
    state
        .metrics
        .http_requests
        .with_label_values(&[method.as_str(), response.status().as_str()])
        .inc();
    response
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
