use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    auth::require_user_id,
    authz::{actor_id, actor_role, is_admin, is_staff, load_actor, ROLE_LANDLORD, ROLE_TENANT},
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows},
    schemas::{
        clamp_limit_in_range, validate_input, CreatePropertyRequestInput,
        PropertyRequestActionInput, PropertyRequestPath, PropertyRequestsQuery,
    },
    services::{
        audit::write_audit_log,
        notification_center::{
            deliver_event, emit_event, EmitNotificationEventInput, NotificationRecipient,
            RelatedKind,
        },
        property_requests::{
            approval_grace_expiry, can_transition, enrich_request_row, history_entry,
            initial_expiry, system_message, transition_note, user_message, RequestStatus,
        },
    },
    state::AppState,
};

use super::payments::owned_property_ids;

const REQUEST_TYPES: &[&str] = &["existing_property", "new_property", "lease_request"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/property-requests",
            axum::routing::get(list_requests).post(create_request),
        )
        .route(
            "/property-requests/{request_id}",
            axum::routing::get(get_request).patch(act_on_request),
        )
}

/// Open a request. The thread, status history and expiry clock all start
/// here. `new_property` requests carry a wanted-property description instead
/// of a property id.
async fn create_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreatePropertyRequestInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    if actor_role(&actor) != ROLE_TENANT && !is_admin(&actor) {
        return Err(AppError::Forbidden(
            "Only tenants can open property requests.".to_string(),
        ));
    }

    let request_type = input.request_type.trim().to_ascii_lowercase();
    if !REQUEST_TYPES.contains(&request_type.as_str()) {
        return Err(AppError::Validation(format!(
            "Unknown request_type '{request_type}'. Expected one of: {}.",
            REQUEST_TYPES.join(", ")
        )));
    }

    let property_id = non_empty_opt(input.property_id.as_deref());
    if property_id.is_none() && request_type != "new_property" {
        return Err(AppError::Validation(
            "property_id is required for this request type.".to_string(),
        ));
    }
    let property = match &property_id {
        Some(id) => Some(get_row(pool, "properties", id, "id").await?),
        None => None,
    };

    let tenant_id = actor_id(&actor);
    let now = Utc::now();

    let mut messages = Vec::new();
    if let Some(text) = non_empty_opt(input.message.as_deref()) {
        messages.push(user_message(&tenant_id, &text));
    }

    let mut record = Map::new();
    record.insert("tenant_id".to_string(), Value::String(tenant_id.clone()));
    record.insert(
        "request_type".to_string(),
        Value::String(request_type.clone()),
    );
    if let Some(id) = &property_id {
        record.insert("property_id".to_string(), Value::String(id.clone()));
    }
    if let Some(property) = &property {
        let landlord_id = value_str(property, "landlord_id");
        if !landlord_id.is_empty() {
            record.insert("landlord_id".to_string(), Value::String(landlord_id));
        }
    }
    if let Some(details) = &input.requested_property_details {
        if details.is_object() {
            record.insert("requested_property_details".to_string(), details.clone());
        }
    }
    if let Some(description) = non_empty_opt(input.description.as_deref()) {
        record.insert("description".to_string(), Value::String(description));
    }
    if let Some(move_in) = non_empty_opt(input.preferred_move_in_date.as_deref()) {
        let parsed = move_in.parse::<chrono::NaiveDate>().map_err(|_| {
            AppError::Validation(
                "Invalid preferred_move_in_date. Expected YYYY-MM-DD.".to_string(),
            )
        })?;
        record.insert(
            "preferred_move_in_date".to_string(),
            Value::String(parsed.to_string()),
        );
    }
    record.insert("status".to_string(), Value::String("pending".to_string()));
    record.insert(
        "expires_at".to_string(),
        Value::String(initial_expiry(now, state.config.request_expiry_days).to_rfc3339()),
    );
    record.insert(
        "status_history".to_string(),
        Value::Array(vec![history_entry(
            RequestStatus::Pending,
            Some(&tenant_id),
            None,
            false,
        )]),
    );
    record.insert("messages".to_string(), Value::Array(messages));
    record.insert("viewed_by_landlord".to_string(), Value::Bool(false));

    let created = create_row(pool, "property_requests", &record).await?;
    let request_id = value_str(&created, "id");

    write_audit_log(
        Some(pool),
        Some(&tenant_id),
        "property_request_created",
        "property_requests",
        &request_id,
        None,
        Some(&created),
    )
    .await;

    let landlord_id = value_str(&created, "landlord_id");
    if !landlord_id.is_empty() {
        notify(
            &state,
            "property_request_created",
            "New property request",
            "A tenant opened a request on one of your properties.",
            &request_id,
            Some(tenant_id),
            vec![NotificationRecipient {
                user_id: landlord_id,
                action_required: true,
                priority: "normal".to_string(),
            }],
        )
        .await;
    }

    Ok(Json(json!({ "data": created })))
}

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<PropertyRequestsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    match actor_role(&actor).as_str() {
        ROLE_TENANT => {
            filters.insert("tenant_id".to_string(), Value::String(actor_id(&actor)));
        }
        ROLE_LANDLORD => {
            filters.insert("landlord_id".to_string(), Value::String(actor_id(&actor)));
            if let Some(property_id) = non_empty_opt(query.property_id.as_deref()) {
                let owned = owned_property_ids(pool, &actor_id(&actor)).await?;
                if !owned.contains(&property_id) {
                    return Err(AppError::Forbidden("Access denied.".to_string()));
                }
                filters.insert("property_id".to_string(), Value::String(property_id));
            }
        }
        _ => {
            if let Some(property_id) = non_empty_opt(query.property_id.as_deref()) {
                filters.insert("property_id".to_string(), Value::String(property_id));
            }
            if let Some(tenant_id) = non_empty_opt(query.tenant_id.as_deref()) {
                filters.insert("tenant_id".to_string(), Value::String(tenant_id));
            }
        }
    }

    let mut rows = list_rows(
        pool,
        "property_requests",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        query.offset.max(0),
        "created_at",
        false,
    )
    .await?;

    let now = Utc::now();
    for row in &mut rows {
        enrich_request_row(row, &state.config, now);
    }
    Ok(Json(json!({ "data": rows })))
}

async fn get_request(
    State(state): State<AppState>,
    Path(path): Path<PropertyRequestPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut request = get_row(pool, "property_requests", &path.request_id, "id").await?;
    assert_participant(&actor, &request)?;

    enrich_request_row(&mut request, &state.config, Utc::now());
    Ok(Json(json!({ "data": request })))
}

/// All request mutations flow through one action endpoint, mirroring how
/// reviews work for payments and invoices.
async fn act_on_request(
    State(state): State<AppState>,
    Path(path): Path<PropertyRequestPath>,
    headers: HeaderMap,
    Json(input): Json<PropertyRequestActionInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let request = get_row(pool, "property_requests", &path.request_id, "id").await?;
    let action = input.action.trim().to_ascii_lowercase();

    let updated = match action.as_str() {
        "start_review" => {
            assert_landlord_side(&actor, &request)?;
            transition(&state, &actor, &request, RequestStatus::UnderReview, &input, None).await?
        }
        "approve" => {
            assert_landlord_side(&actor, &request)?;
            let grace = approval_grace_expiry(Utc::now(), state.config.request_approval_grace_days);
            transition(
                &state,
                &actor,
                &request,
                RequestStatus::Approved,
                &input,
                Some(grace.to_rfc3339()),
            )
            .await?
        }
        "reject" => {
            assert_landlord_side(&actor, &request)?;
            if non_empty_opt(input.rejection_reason.as_deref()).is_none() {
                return Err(AppError::Validation(
                    "A rejection requires a rejection_reason.".to_string(),
                ));
            }
            transition(&state, &actor, &request, RequestStatus::Rejected, &input, None).await?
        }
        "cancel" => {
            if value_str(&request, "tenant_id") != actor_id(&actor) && !is_admin(&actor) {
                return Err(AppError::Forbidden("Access denied.".to_string()));
            }
            transition(&state, &actor, &request, RequestStatus::Cancelled, &input, None).await?
        }
        "reopen" => {
            // Terminal states are final for tenants and landlords; only an
            // admin can return a request to the queue.
            crate::authz::assert_admin(&actor)?;
            let current = RequestStatus::parse(&value_str(&request, "status"))?;
            if !current.is_terminal() {
                return Err(AppError::InvalidState(format!(
                    "Only a closed request can be reopened, not '{}'.",
                    current.as_str()
                )));
            }
            let fresh_expiry = initial_expiry(Utc::now(), state.config.request_expiry_days);
            reopen(&state, &actor, &request, &input, fresh_expiry.to_rfc3339()).await?
        }
        "add_message" => {
            assert_participant(&actor, &request)?;
            add_message(&state, &actor, &request, &input).await?
        }
        "mark_viewed" => {
            assert_landlord_side(&actor, &request)?;
            mark_viewed(pool, &request).await?
        }
        other => {
            return Err(AppError::Validation(format!(
                "Unknown action '{other}'. Expected start_review, approve, reject, cancel, reopen, add_message or mark_viewed."
            )));
        }
    };

    Ok(Json(json!({ "data": updated })))
}

/// Guarded status transition with history entry, system message and the
/// landlord response captured for approve/reject, in one statement.
async fn transition(
    state: &AppState,
    actor: &Value,
    request: &Value,
    next: RequestStatus,
    input: &PropertyRequestActionInput,
    new_expires_at: Option<String>,
) -> AppResult<Value> {
    let pool = db_pool(state)?;
    let request_id = value_str(request, "id");
    let current = RequestStatus::parse(&value_str(request, "status"))?;
    if !can_transition(current, next) {
        return Err(AppError::InvalidState(format!(
            "Request cannot move from '{}' to '{}'.",
            current.as_str(),
            next.as_str()
        )));
    }

    let changed_by = actor_id(actor);
    let note = non_empty_opt(input.note.as_deref());
    let entry = history_entry(next, Some(&changed_by), note.as_deref(), false);
    let mut appended_messages = vec![system_message(transition_note(next))];
    if let Some(text) = non_empty_opt(input.message.as_deref()) {
        appended_messages.push(user_message(&changed_by, &text));
    }

    let landlord_response = match next {
        RequestStatus::Approved => Some(json!({
            "message": non_empty_opt(input.message.as_deref()),
            "responded_at": Utc::now().to_rfc3339(),
            "next_steps": non_empty_opt(input.next_steps.as_deref()),
        })),
        RequestStatus::Rejected => Some(json!({
            "message": non_empty_opt(input.message.as_deref()),
            "responded_at": Utc::now().to_rfc3339(),
            "rejection_reason": non_empty_opt(input.rejection_reason.as_deref()),
        })),
        _ => None,
    };

    let row = sqlx::query(
        "UPDATE property_requests
         SET status = $1,
             status_history = COALESCE(status_history, '[]'::jsonb) || $2::jsonb,
             messages = COALESCE(messages, '[]'::jsonb) || $3::jsonb,
             landlord_response = COALESCE($4::jsonb, landlord_response),
             expires_at = COALESCE($5::timestamptz, expires_at),
             updated_at = now()
         WHERE id = $6::uuid AND status = $7
         RETURNING row_to_json(property_requests.*) AS row",
    )
    .bind(next.as_str())
    .bind(json!([entry]))
    .bind(Value::Array(appended_messages))
    .bind(landlord_response)
    .bind(new_expires_at)
    .bind(&request_id)
    .bind(current.as_str())
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    let Some(updated) = row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten())
    else {
        return Err(AppError::InvalidState(
            "The request changed concurrently. Reload and try again.".to_string(),
        ));
    };

    write_audit_log(
        Some(pool),
        Some(&changed_by),
        &format!("property_request_{}", next.as_str()),
        "property_requests",
        &request_id,
        Some(request),
        Some(&updated),
    )
    .await;

    notify_transition(state, actor, request, next).await;
    Ok(updated)
}

async fn reopen(
    state: &AppState,
    actor: &Value,
    request: &Value,
    input: &PropertyRequestActionInput,
    new_expires_at: String,
) -> AppResult<Value> {
    let pool = db_pool(state)?;
    let request_id = value_str(request, "id");
    let current = value_str(request, "status");
    let changed_by = actor_id(actor);

    let entry = history_entry(
        RequestStatus::Pending,
        Some(&changed_by),
        non_empty_opt(input.note.as_deref()).as_deref(),
        false,
    );
    let message = system_message(transition_note(RequestStatus::Pending));

    let row = sqlx::query(
        "UPDATE property_requests
         SET status = 'pending',
             status_history = COALESCE(status_history, '[]'::jsonb) || $1::jsonb,
             messages = COALESCE(messages, '[]'::jsonb) || $2::jsonb,
             landlord_response = NULL,
             expires_at = $3::timestamptz,
             updated_at = now()
         WHERE id = $4::uuid AND status = $5
         RETURNING row_to_json(property_requests.*) AS row",
    )
    .bind(json!([entry]))
    .bind(json!([message]))
    .bind(new_expires_at)
    .bind(&request_id)
    .bind(&current)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    let Some(updated) = row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten())
    else {
        return Err(AppError::InvalidState(
            "The request changed concurrently. Reload and try again.".to_string(),
        ));
    };

    write_audit_log(
        Some(pool),
        Some(&changed_by),
        "property_request_reopened",
        "property_requests",
        &request_id,
        Some(request),
        Some(&updated),
    )
    .await;

    notify_transition(state, actor, request, RequestStatus::Pending).await;
    Ok(updated)
}

async fn add_message(
    state: &AppState,
    actor: &Value,
    request: &Value,
    input: &PropertyRequestActionInput,
) -> AppResult<Value> {
    let pool = db_pool(state)?;
    let Some(text) = non_empty_opt(input.message.as_deref()) else {
        return Err(AppError::Validation(
            "add_message requires a non-empty message.".to_string(),
        ));
    };
    let current = RequestStatus::parse(&value_str(request, "status"))?;
    if current.is_terminal() {
        return Err(AppError::InvalidState(
            "The request is closed; no further messages can be added.".to_string(),
        ));
    }

    let sender_id = actor_id(actor);
    let from_tenant = sender_id == value_str(request, "tenant_id");
    let message = user_message(&sender_id, &text);

    // A landlord reply marks the thread seen; a tenant message resets the
    // landlord's unseen flag.
    let row = sqlx::query(
        "UPDATE property_requests
         SET messages = COALESCE(messages, '[]'::jsonb) || $1::jsonb,
             viewed_by_landlord = $2,
             viewed_at = CASE WHEN $2 THEN now() ELSE viewed_at END,
             updated_at = now()
         WHERE id = $3::uuid
         RETURNING row_to_json(property_requests.*) AS row",
    )
    .bind(json!([message]))
    .bind(!from_tenant)
    .bind(value_str(request, "id"))
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    let updated = row
        .and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound("property_requests record not found.".to_string()))?;

    let recipient = if from_tenant {
        Some(value_str(request, "landlord_id")).filter(|id| !id.is_empty())
    } else {
        Some(value_str(request, "tenant_id")).filter(|id| !id.is_empty())
    };
    if let Some(recipient_id) = recipient {
        notify(
            state,
            "property_request_message",
            "New message on a property request",
            "You have a new message on a property request.",
            &value_str(request, "id"),
            Some(sender_id),
            vec![NotificationRecipient {
                user_id: recipient_id,
                action_required: false,
                priority: "normal".to_string(),
            }],
        )
        .await;
    }

    Ok(updated)
}

/// Stamp the landlord's view and mark every tenant-authored message read in
/// one pass.
async fn mark_viewed(pool: &sqlx::PgPool, request: &Value) -> AppResult<Value> {
    let row = sqlx::query(
        "UPDATE property_requests
         SET viewed_by_landlord = true,
             viewed_at = now(),
             messages = COALESCE((
                 SELECT jsonb_agg(
                     CASE WHEN elem->>'sender_id' = tenant_id::text
                          THEN jsonb_set(elem, '{is_read}', 'true'::jsonb)
                          ELSE elem
                     END)
                 FROM jsonb_array_elements(COALESCE(messages, '[]'::jsonb)) AS elem
             ), '[]'::jsonb),
             updated_at = now()
         WHERE id = $1::uuid
         RETURNING row_to_json(property_requests.*) AS row",
    )
    .bind(value_str(request, "id"))
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound("property_requests record not found.".to_string()))
}

/// The tenant who opened the request, the landlord it is addressed to, and
/// staff may read the thread.
fn assert_participant(actor: &Value, request: &Value) -> AppResult<()> {
    if is_staff(actor) {
        return Ok(());
    }
    let id = actor_id(actor);
    if value_str(request, "tenant_id") == id {
        return Ok(());
    }
    if actor_role(actor) == ROLE_LANDLORD && value_str(request, "landlord_id") == id {
        return Ok(());
    }
    Err(AppError::Forbidden("Access denied.".to_string()))
}

fn assert_landlord_side(actor: &Value, request: &Value) -> AppResult<()> {
    if is_staff(actor) {
        return Ok(());
    }
    if actor_role(actor) == ROLE_LANDLORD
        && value_str(request, "landlord_id") == actor_id(actor)
    {
        return Ok(());
    }
    Err(AppError::Forbidden("Access denied.".to_string()))
}

async fn notify_transition(state: &AppState, actor: &Value, before: &Value, next: RequestStatus) {
    let request_id = value_str(before, "id");
    let tenant_id = value_str(before, "tenant_id");
    let actor_user = actor_id(actor);

    // Transitions driven by the landlord side inform the tenant; tenant
    // cancellations inform the landlord.
    let recipient = if next == RequestStatus::Cancelled && actor_user == tenant_id {
        Some(value_str(before, "landlord_id")).filter(|id| !id.is_empty())
    } else {
        Some(tenant_id).filter(|id| !id.is_empty() && *id != actor_user)
    };
    let Some(recipient_id) = recipient else {
        return;
    };

    let (title, body) = match next {
        RequestStatus::UnderReview => (
            "Request under review",
            "The landlord is reviewing your property request.",
        ),
        RequestStatus::Approved => (
            "Request approved",
            "Your property request was approved.",
        ),
        RequestStatus::Rejected => (
            "Request rejected",
            "Your property request was rejected.",
        ),
        RequestStatus::Cancelled => ("Request cancelled", "A property request was cancelled."),
        RequestStatus::Pending => (
            "Request reopened",
            "A property request was returned to the queue.",
        ),
        _ => return,
    };

    let approved = next == RequestStatus::Approved;
    notify(
        state,
        &format!("property_request_{}", next.as_str()),
        title,
        body,
        &request_id,
        Some(actor_user),
        vec![NotificationRecipient {
            user_id: recipient_id,
            action_required: approved,
            priority: if approved { "high" } else { "normal" }.to_string(),
        }],
    )
    .await;
}

async fn notify(
    state: &AppState,
    event_type: &str,
    title: &str,
    body: &str,
    request_id: &str,
    actor_user_id: Option<String>,
    recipients: Vec<NotificationRecipient>,
) {
    let Ok(pool) = db_pool(state) else {
        return;
    };
    let emitted = emit_event(
        pool,
        EmitNotificationEventInput {
            event_type: event_type.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            related: Some((RelatedKind::PropertyRequest, request_id.to_string())),
            actor_user_id,
            payload: Map::new(),
            dedupe_key: None,
            recipients,
        },
    )
    .await;

    match emitted {
        Ok(Some(event)) => {
            deliver_event(pool, &state.http_client, &state.config, &event).await;
        }
        Ok(None) => {}
        Err(error) => {
            tracing::warn!(error = %error, event_type, "Request notification failed");
        }
    }
}

fn map_db_error(error: sqlx::Error) -> AppError {
    tracing::error!(error = %error, "Property request query failed");
    AppError::Dependency("Database operation failed.".to_string())
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{assert_landlord_side, assert_participant};

    #[test]
    fn participants_are_the_tenant_the_landlord_and_staff() {
        let request = json!({"tenant_id": "t-1", "landlord_id": "l-1"});
        let tenant = json!({"id": "t-1", "role": "tenant"});
        let landlord = json!({"id": "l-1", "role": "landlord"});
        let other_landlord = json!({"id": "l-2", "role": "landlord"});
        let admin = json!({"id": "a-1", "role": "admin"});

        assert!(assert_participant(&tenant, &request).is_ok());
        assert!(assert_participant(&landlord, &request).is_ok());
        assert!(assert_participant(&admin, &request).is_ok());
        assert!(assert_participant(&other_landlord, &request).is_err());
    }

    #[test]
    fn landlord_side_actions_exclude_the_tenant() {
        let request = json!({"tenant_id": "t-1", "landlord_id": "l-1"});
        let tenant = json!({"id": "t-1", "role": "tenant"});
        let landlord = json!({"id": "l-1", "role": "landlord"});

        assert!(assert_landlord_side(&tenant, &request).is_err());
        assert!(assert_landlord_side(&landlord, &request).is_ok());
    }
}
