use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{Datelike, Months, NaiveDate};
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    auth::require_user_id,
    authz::{actor_id, actor_role, is_staff, load_actor, ROLE_LANDLORD, ROLE_TENANT},
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows},
    schemas::{clamp_limit_in_range, validate_input, CreateLeaseInput, LeasePath, LeasesQuery},
    services::{
        audit::write_audit_log,
        ledger::round2,
        notification_center::{
            deliver_event, emit_event, EmitNotificationEventInput, NotificationRecipient,
            RelatedKind,
        },
        property_requests::{
            can_transition, history_entry, system_message, transition_note, RequestStatus,
        },
    },
    state::AppState,
};

use super::payments::{assert_record_access, owned_property_ids};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/leases",
            axum::routing::get(list_leases).post(create_lease),
        )
        .route("/leases/{lease_id}", axum::routing::get(get_lease))
        .route(
            "/leases/{lease_id}/activate",
            axum::routing::post(activate_lease),
        )
}

/// Draft a lease, optionally from an approved property request. Linking a
/// request moves it to `lease_requested` so the tenant sees the paperwork
/// is underway.
async fn create_lease(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateLeaseInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let property = get_row(pool, "properties", &input.property_id, "id").await?;
    assert_lease_author(&actor, &property)?;

    let start_date = input
        .start_date
        .trim()
        .parse::<NaiveDate>()
        .map_err(|_| AppError::Validation("Invalid start_date. Expected YYYY-MM-DD.".to_string()))?;
    let end_date = match input.end_date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            let parsed = raw.parse::<NaiveDate>().map_err(|_| {
                AppError::Validation("Invalid end_date. Expected YYYY-MM-DD.".to_string())
            })?;
            if parsed <= start_date {
                return Err(AppError::Validation(
                    "end_date must come after start_date.".to_string(),
                ));
            }
            Some(parsed)
        }
        _ => None,
    };

    let linked_request = match non_empty_opt(input.property_request_id.as_deref()) {
        Some(request_id) => {
            let request = get_row(pool, "property_requests", &request_id, "id").await?;
            let status = RequestStatus::parse(&value_str(&request, "status"))?;
            if !can_transition(status, RequestStatus::LeaseRequested) {
                return Err(AppError::InvalidState(format!(
                    "A lease can only be drafted from an approved request, not '{}'.",
                    status.as_str()
                )));
            }
            if value_str(&request, "tenant_id") != input.tenant_id
                || value_str(&request, "property_id") != input.property_id
            {
                return Err(AppError::Validation(
                    "The request belongs to a different tenant or property.".to_string(),
                ));
            }
            Some(request)
        }
        None => None,
    };

    let mut record = Map::new();
    record.insert(
        "tenant_id".to_string(),
        Value::String(input.tenant_id.clone()),
    );
    record.insert(
        "property_id".to_string(),
        Value::String(input.property_id.clone()),
    );
    let landlord_id = value_str(&property, "landlord_id");
    if !landlord_id.is_empty() {
        record.insert("landlord_id".to_string(), Value::String(landlord_id));
    }
    record.insert("start_date".to_string(), Value::String(start_date.to_string()));
    if let Some(end) = end_date {
        record.insert("end_date".to_string(), Value::String(end.to_string()));
    }
    record.insert("monthly_rent".to_string(), json!(round2(input.monthly_rent)));
    record.insert(
        "security_deposit".to_string(),
        json!(round2(input.security_deposit)),
    );
    record.insert("payment_due_day".to_string(), json!(input.payment_due_day));
    record.insert("total_paid".to_string(), json!(0.0));
    record.insert("balance_due".to_string(), json!(round2(input.monthly_rent)));
    record.insert(
        "next_payment_due".to_string(),
        Value::String(first_due_date(start_date, input.payment_due_day as u32).to_string()),
    );
    if let Some(notes) = non_empty_opt(input.notes.as_deref()) {
        record.insert("notes".to_string(), Value::String(notes));
    }
    record.insert("status".to_string(), Value::String("draft".to_string()));

    let created = create_row(pool, "leases", &record).await?;
    let lease_id = value_str(&created, "id");

    if let Some(request) = &linked_request {
        advance_linked_request(
            pool,
            request,
            RequestStatus::LeaseRequested,
            &actor_id(&actor),
            Some(&lease_id),
        )
        .await?;
    }

    write_audit_log(
        Some(pool),
        Some(&actor_id(&actor)),
        "lease_created",
        "leases",
        &lease_id,
        None,
        Some(&created),
    )
    .await;

    Ok(Json(json!({ "data": created })))
}

/// Activate a drafted lease. The linked property request, when present,
/// reaches its terminal happy state here.
async fn activate_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let lease = get_row(pool, "leases", &path.lease_id, "id").await?;
    let property = get_row(pool, "properties", &value_str(&lease, "property_id"), "id").await?;
    assert_lease_author(&actor, &property)?;

    let row = sqlx::query(
        "UPDATE leases
         SET status = 'active', updated_at = now()
         WHERE id = $1::uuid AND status = 'draft'
         RETURNING row_to_json(leases.*) AS row",
    )
    .bind(&path.lease_id)
    .fetch_optional(pool)
    .await
    .map_err(|error| {
        tracing::error!(error = %error, "Lease activation failed");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    let Some(updated) = row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten())
    else {
        return Err(AppError::InvalidState(
            "Only a draft lease can be activated.".to_string(),
        ));
    };

    if let Some(request) = linked_request_of(pool, &path.lease_id).await {
        if let Err(error) = advance_linked_request(
            pool,
            &request,
            RequestStatus::LeaseActive,
            &actor_id(&actor),
            None,
        )
        .await
        {
            let request_id = value_str(&request, "id");
            tracing::warn!(error = %error, request_id = %request_id, "Linked request did not advance");
        }
    }

    write_audit_log(
        Some(pool),
        Some(&actor_id(&actor)),
        "lease_activated",
        "leases",
        &path.lease_id,
        Some(&lease),
        Some(&updated),
    )
    .await;

    notify_activation(&state, &actor, &updated).await;

    Ok(Json(json!({ "data": updated })))
}

async fn list_leases(
    State(state): State<AppState>,
    Query(query): Query<LeasesQuery>,
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
            let owned = owned_property_ids(pool, &actor_id(&actor)).await?;
            if owned.is_empty() {
                return Ok(Json(json!({ "data": [] })));
            }
            match non_empty_opt(query.property_id.as_deref()) {
                Some(property_id) if owned.contains(&property_id) => {
                    filters.insert("property_id".to_string(), Value::String(property_id));
                }
                Some(_) => return Err(AppError::Forbidden("Access denied.".to_string())),
                None => {
                    filters.insert(
                        "property_id".to_string(),
                        Value::Array(owned.into_iter().map(Value::String).collect()),
                    );
                }
            }
            if let Some(tenant_id) = non_empty_opt(query.tenant_id.as_deref()) {
                filters.insert("tenant_id".to_string(), Value::String(tenant_id));
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

    let rows = list_rows(
        pool,
        "leases",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        query.offset.max(0),
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn get_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let lease = get_row(pool, "leases", &path.lease_id, "id").await?;
    assert_record_access(&state, &actor, &lease).await?;

    Ok(Json(json!({ "data": lease })))
}

/// First rent due date on or after the lease start, on the configured day
/// of month.
fn first_due_date(start_date: NaiveDate, due_day: u32) -> NaiveDate {
    let day = due_day.clamp(1, 28);
    let same_month = NaiveDate::from_ymd_opt(start_date.year(), start_date.month(), day)
        .unwrap_or(start_date);
    if same_month >= start_date {
        same_month
    } else {
        same_month
            .checked_add_months(Months::new(1))
            .unwrap_or(same_month)
    }
}

/// The request this lease was drafted from, when one exists.
async fn linked_request_of(pool: &sqlx::PgPool, lease_id: &str) -> Option<Value> {
    let mut filters = Map::new();
    filters.insert(
        "created_lease_id".to_string(),
        Value::String(lease_id.to_string()),
    );
    list_rows(pool, "property_requests", Some(&filters), 1, 0, "created_at", false)
        .await
        .ok()?
        .into_iter()
        .next()
}

/// Move a linked property request along the lease path, recording the same
/// history entry and system message an explicit transition would. Drafting
/// stamps `created_lease_id` so activation can find its way back.
async fn advance_linked_request(
    pool: &sqlx::PgPool,
    request: &Value,
    next: RequestStatus,
    changed_by: &str,
    created_lease_id: Option<&str>,
) -> AppResult<()> {
    let current = RequestStatus::parse(&value_str(request, "status"))?;
    if !can_transition(current, next) {
        return Err(AppError::InvalidState(format!(
            "Request cannot move from '{}' to '{}'.",
            current.as_str(),
            next.as_str()
        )));
    }

    let entry = history_entry(next, Some(changed_by), None, false);
    let message = system_message(transition_note(next));
    let updated = sqlx::query(
        "UPDATE property_requests
         SET status = $1,
             status_history = COALESCE(status_history, '[]'::jsonb) || $2::jsonb,
             messages = COALESCE(messages, '[]'::jsonb) || $3::jsonb,
             created_lease_id = COALESCE($6::uuid, created_lease_id),
             updated_at = now()
         WHERE id = $4::uuid AND status = $5
         RETURNING 1",
    )
    .bind(next.as_str())
    .bind(json!([entry]))
    .bind(json!([message]))
    .bind(value_str(request, "id"))
    .bind(current.as_str())
    .bind(created_lease_id)
    .fetch_optional(pool)
    .await
    .map_err(|error| {
        tracing::error!(error = %error, "Linked request transition failed");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    if updated.is_none() {
        return Err(AppError::InvalidState(
            "The request changed concurrently. Reload and try again.".to_string(),
        ));
    }
    Ok(())
}

fn assert_lease_author(actor: &Value, property: &Value) -> AppResult<()> {
    if is_staff(actor) {
        return Ok(());
    }
    if actor_role(actor) == ROLE_LANDLORD
        && value_str(property, "landlord_id") == actor_id(actor)
    {
        return Ok(());
    }
    Err(AppError::Forbidden("Access denied.".to_string()))
}

async fn notify_activation(state: &AppState, actor: &Value, lease: &Value) {
    let Ok(pool) = db_pool(state) else {
        return;
    };
    let tenant_id = value_str(lease, "tenant_id");
    if tenant_id.is_empty() {
        return;
    }
    let lease_id = value_str(lease, "id");
    let emitted = emit_event(
        pool,
        EmitNotificationEventInput {
            event_type: "lease_activated".to_string(),
            title: "Lease active".to_string(),
            body: "Your lease is now active.".to_string(),
            related: Some((RelatedKind::Lease, lease_id.clone())),
            actor_user_id: Some(actor_id(actor)),
            payload: Map::new(),
            dedupe_key: Some(format!("lease_activated:{lease_id}")),
            recipients: vec![NotificationRecipient {
                user_id: tenant_id,
                action_required: false,
                priority: "normal".to_string(),
            }],
        },
    )
    .await;

    match emitted {
        Ok(Some(event)) => {
            deliver_event(pool, &state.http_client, &state.config, &event).await;
        }
        Ok(None) => {}
        Err(error) => {
            tracing::warn!(error = %error, "Lease activation notification failed");
        }
    }
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
    use chrono::NaiveDate;

    use super::first_due_date;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn first_due_date_lands_on_or_after_the_start() {
        assert_eq!(first_due_date(date(2026, 4, 1), 1), date(2026, 4, 1));
        assert_eq!(first_due_date(date(2026, 4, 2), 1), date(2026, 5, 1));
        assert_eq!(first_due_date(date(2026, 4, 15), 28), date(2026, 4, 28));
        // Out-of-range days clamp to 28 so February always has a slot.
        assert_eq!(first_due_date(date(2026, 2, 1), 31), date(2026, 2, 28));
    }
}
