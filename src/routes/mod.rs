use axum::{routing::get, Router};

use crate::state::AppState;

pub mod approvals;
pub mod health;
pub mod identity;
pub mod invoices;
pub mod leases;
pub mod notifications;
pub mod payments;
pub mod platform;
pub mod property_requests;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/me", get(identity::me))
        .merge(payments::router())
        .merge(invoices::router())
        .merge(approvals::router())
        .merge(leases::router())
        .merge(property_requests::router())
        .merge(notifications::router())
        .merge(platform::router())
}
