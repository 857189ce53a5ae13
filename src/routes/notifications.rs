use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    schemas::{clamp_limit_in_range, NotificationPath, NotificationsQuery},
    services::notification_center::{list_for_user, mark_all_read, mark_read, unread_count},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/notifications", axum::routing::get(list_notifications))
        .route(
            "/notifications/unread-count",
            axum::routing::get(get_unread_count),
        )
        .route(
            "/notifications/read-all",
            axum::routing::patch(read_all_notifications),
        )
        .route(
            "/notifications/{notification_id}/read",
            axum::routing::patch(read_notification),
        )
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let result = list_for_user(
        pool,
        &user_id,
        query.unread_only,
        query.event_type.as_deref(),
        query.cursor.as_deref(),
        clamp_limit_in_range(query.limit, 1, 200),
    )
    .await?;

    Ok(Json(json!({
        "data": result.data,
        "next_cursor": result.next_cursor,
    })))
}

async fn get_unread_count(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let count = unread_count(pool, &user_id).await?;
    Ok(Json(json!({ "data": { "unread": count } })))
}

/// Marking an already-read notification again is a no-op that returns the
/// row unchanged.
async fn read_notification(
    State(state): State<AppState>,
    Path(path): Path<NotificationPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let updated = mark_read(pool, &user_id, &path.notification_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Notification not found.".to_string()))?;
    Ok(Json(json!({ "data": updated })))
}

async fn read_all_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let updated = mark_all_read(pool, &user_id).await?;
    Ok(Json(json!({ "data": { "marked_read": updated } })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
