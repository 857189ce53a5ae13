use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{auth::require_user_id, authz::load_actor, error::AppResult, state::AppState};

/// The authenticated user's own profile, including role and permissions,
/// as clients need it to decide which views to render.
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    Ok(Json(json!({ "data": actor })))
}
