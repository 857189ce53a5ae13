use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    services::{ledger::run_overdue_invoice_sweep, property_requests::run_request_expiry_sweep},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/internal/sweeps/overdue-invoices",
            axum::routing::post(sweep_overdue_invoices),
        )
        .route(
            "/internal/sweeps/expire-requests",
            axum::routing::post(sweep_expired_requests),
        )
}

/// Sweep endpoints are driven by an external scheduler, not by end users.
/// They authenticate with a shared token instead of a user session.
fn require_scheduler_token(configured: Option<&str>, headers: &HeaderMap) -> AppResult<()> {
    let Some(expected) = configured
        .map(str::trim)
        .filter(|token| !token.is_empty())
    else {
        return Err(AppError::Dependency(
            "Scheduler endpoints are not configured. Set SCHEDULER_TOKEN.".to_string(),
        ));
    };

    let provided = headers
        .get("x-scheduler-token")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if provided != expected {
        return Err(AppError::Forbidden("Invalid scheduler token.".to_string()));
    }
    Ok(())
}

async fn sweep_overdue_invoices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_scheduler_token(state.config.scheduler_token.as_deref(), &headers)?;
    let pool = db_pool(&state)?;

    let result = run_overdue_invoice_sweep(pool, state.config.operating_timezone).await;
    Ok(Json(json!({ "data": result })))
}

async fn sweep_expired_requests(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_scheduler_token(state.config.scheduler_token.as_deref(), &headers)?;
    let pool = db_pool(&state)?;

    let result = run_request_expiry_sweep(pool, &state.config).await;
    Ok(Json(json!({ "data": result })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;

    use super::require_scheduler_token;

    #[test]
    fn rejects_when_no_token_is_configured() {
        let headers = HeaderMap::new();
        assert!(require_scheduler_token(None, &headers).is_err());
        assert!(require_scheduler_token(Some("   "), &headers).is_err());
    }

    #[test]
    fn rejects_a_wrong_token_and_accepts_the_right_one() {
        let mut headers = HeaderMap::new();
        headers.insert("x-scheduler-token", "nope".parse().unwrap());
        assert!(require_scheduler_token(Some("sweep-secret"), &headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-scheduler-token", "sweep-secret".parse().unwrap());
        assert!(require_scheduler_token(Some("sweep-secret"), &headers).is_ok());
    }
}
