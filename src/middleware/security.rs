use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::state::AppState;

/// Reject requests whose Host header is not in TRUSTED_HOSTS. A lone "*"
/// entry disables the check (local development).
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let trusted = &state.config.trusted_hosts;
    if trusted.iter().any(|host| host.trim() == "*") {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port)
        .unwrap_or_default();

    let allowed = !host.is_empty()
        && trusted
            .iter()
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(host));

    if !allowed {
        tracing::warn!(host, "Rejected request from untrusted host");
        return AppError::Validation("Invalid host header.".to_string()).into_response();
    }

    next.run(request).await
}

fn strip_port(host: &str) -> &str {
    let trimmed = host.trim();
    // IPv6 literals keep their brackets; everything else drops the :port.
    if trimmed.starts_with('[') {
        return trimmed.split(']').next().map(|value| value.trim_start_matches('[')).unwrap_or(trimmed);
    }
    trimmed.split(':').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::strip_port;

    #[test]
    fn strips_port_suffixes() {
        assert_eq!(strip_port("localhost:8000"), "localhost");
        assert_eq!(strip_port("api.rentora.co"), "api.rentora.co");
        assert_eq!(strip_port("127.0.0.1:443"), "127.0.0.1");
        assert_eq!(strip_port("[::1]:8000"), "::1");
    }
}
