use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

/// Resolve the calling user id from the request headers.
///
/// Verification order: dev override header (non-production only), cached
/// verdict, local HS256 decode when AUTH_JWT_SECRET is set, otherwise the
/// HTTP introspection fallback.
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_value(headers, "x-user-id") {
            return Ok(user_id);
        }
        if let Some(user_id) = state
            .config
            .default_user_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Ok(user_id.to_string());
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Missing or malformed Authorization header.".to_string())
    })?;

    let cache_key = token_fingerprint(&token);
    if let Some(user_id) = state.auth_cache.get(&cache_key).await {
        return Ok(user_id);
    }

    let user_id = if let Some(secret) = state.config.auth_jwt_secret.as_deref() {
        decode_local(state, &token, secret)?
    } else if state.config.auth_introspection_url.is_some() {
        introspect_remote(state, &token).await?
    } else {
        return Err(AppError::Unauthorized(
            "Authentication is not configured on this deployment.".to_string(),
        ));
    };

    state.auth_cache.insert(cache_key, user_id.clone()).await;
    Ok(user_id)
}

fn decode_local(state: &AppState, token: &str, secret: &str) -> AppResult<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    match state.config.auth_jwt_audience.as_deref() {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }

    let data = decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|error| {
        tracing::debug!(error = %error, "Bearer token failed local verification");
        AppError::Unauthorized("Invalid or expired token.".to_string())
    })?;

    let user_id = data.claims.sub.trim().to_string();
    if user_id.is_empty() {
        return Err(AppError::Unauthorized(
            "Token is missing a subject claim.".to_string(),
        ));
    }
    Ok(user_id)
}

async fn introspect_remote(state: &AppState, token: &str) -> AppResult<String> {
    let url = state
        .config
        .auth_introspection_url
        .as_deref()
        .ok_or_else(|| AppError::Unauthorized("Authentication is not configured.".to_string()))?;

    let response = state
        .http_client
        .get(url)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "Auth introspection request failed");
            AppError::Dependency("Authentication service is unavailable.".to_string())
        })?;

    if response.status() == reqwest::StatusCode::UNAUTHORIZED
        || response.status() == reqwest::StatusCode::FORBIDDEN
    {
        return Err(AppError::Unauthorized(
            "Invalid or expired token.".to_string(),
        ));
    }
    if !response.status().is_success() {
        tracing::error!(status = %response.status(), "Auth introspection returned an error status");
        return Err(AppError::Dependency(
            "Authentication service is unavailable.".to_string(),
        ));
    }

    let body = response.json::<IntrospectionResponse>().await.map_err(|error| {
        tracing::error!(error = %error, "Auth introspection returned an unreadable body");
        AppError::Dependency("Authentication service is unavailable.".to_string())
    })?;

    body.id
        .or(body.sub)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Invalid or expired token.".to_string()))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?.trim();
    let token = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;

    use super::{bearer_token, token_fingerprint};

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));

        let mut lowercase = HeaderMap::new();
        lowercase.insert("authorization", "bearer tok".parse().unwrap());
        assert_eq!(bearer_token(&lowercase).as_deref(), Some("tok"));

        let mut basic = HeaderMap::new();
        basic.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&basic), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        assert_eq!(token_fingerprint("tok"), token_fingerprint("tok"));
        assert_ne!(token_fingerprint("tok"), token_fingerprint("tok2"));
        assert_eq!(token_fingerprint("tok").len(), 64);
    }
}
