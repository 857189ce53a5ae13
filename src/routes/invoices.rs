use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    auth::require_user_id,
    authz::{actor_id, actor_role, is_staff, load_actor, ROLE_LANDLORD},
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateInvoiceInput,
        InvoicePath, InvoicesQuery,
    },
    services::{
        approvals::{already_submitted, history_entry},
        audit::write_audit_log,
        identifiers::{generate_invoice_number, InvoiceNumberStore},
        ledger::{compute_invoice_totals, normalize_line_items, outstanding_amount},
        notification_center::{
            deliver_event, emit_event, resolve_approver_recipients, EmitNotificationEventInput,
            RelatedKind,
        },
    },
    state::AppState,
};

use super::payments::{assert_record_access, owned_property_ids};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/invoices",
            axum::routing::get(list_invoices).post(create_invoice),
        )
        .route("/invoices/{invoice_id}", axum::routing::get(get_invoice))
        .route(
            "/invoices/{invoice_id}/submit",
            axum::routing::post(submit_invoice),
        )
}

/// Create a draft invoice. Money fields are derived server-side from the
/// line items; the draft stays out of the review queue until an explicit
/// submit.
async fn create_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateInvoiceInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let property = get_row(pool, "properties", &input.property_id, "id").await?;
    assert_invoice_author(&actor, &property)?;

    let raw_items: Vec<Value> = input
        .line_items
        .iter()
        .map(|item| Value::Object(remove_nulls(serialize_to_map(item))))
        .collect();
    let line_items = normalize_line_items(&raw_items)?;
    let totals = compute_invoice_totals(&line_items, input.tax_amount)?;

    let due_date = input
        .due_date
        .trim()
        .parse::<chrono::NaiveDate>()
        .map_err(|_| AppError::Validation("Invalid due_date. Expected YYYY-MM-DD.".to_string()))?;
    let issue_date = match input.issue_date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw.parse::<chrono::NaiveDate>().map_err(|_| {
            AppError::Validation("Invalid issue_date. Expected YYYY-MM-DD.".to_string())
        })?,
        _ => chrono::Utc::now()
            .with_timezone(&state.config.operating_timezone)
            .date_naive(),
    };

    let invoice_number = generate_invoice_number(
        &InvoiceNumberStore(pool),
        state.config.operating_timezone,
        state.config.identifier_max_attempts,
    )
    .await?;

    let mut record = Map::new();
    record.insert(
        "invoice_number".to_string(),
        Value::String(invoice_number),
    );
    record.insert(
        "tenant_id".to_string(),
        Value::String(input.tenant_id.clone()),
    );
    record.insert(
        "property_id".to_string(),
        Value::String(input.property_id.clone()),
    );
    if let Some(lease_id) = non_empty_opt(input.lease_id.as_deref()) {
        record.insert("lease_id".to_string(), Value::String(lease_id));
    }
    record.insert("line_items".to_string(), Value::Array(line_items));
    record.insert("subtotal".to_string(), json!(totals.subtotal));
    record.insert("tax_amount".to_string(), json!(totals.tax_amount));
    record.insert("total_amount".to_string(), json!(totals.total_amount));
    record.insert("paid_amount".to_string(), json!(0.0));
    record.insert("payments".to_string(), Value::Array(Vec::new()));
    record.insert("issue_date".to_string(), Value::String(issue_date.to_string()));
    record.insert("due_date".to_string(), Value::String(due_date.to_string()));
    if let Some(notes) = non_empty_opt(input.notes.as_deref()) {
        record.insert("notes".to_string(), Value::String(notes));
    }
    record.insert("status".to_string(), Value::String("draft".to_string()));
    record.insert(
        "approval_status".to_string(),
        Value::String("pending".to_string()),
    );
    record.insert(
        "approval_history".to_string(),
        Value::Array(Vec::new()),
    );

    let created = create_row(pool, "invoices", &record).await?;

    write_audit_log(
        Some(pool),
        Some(&actor_id(&actor)),
        "invoice_created",
        "invoices",
        &value_str(&created, "id"),
        None,
        Some(&created),
    )
    .await;

    Ok(Json(json!({ "data": created })))
}

/// Move a draft invoice into the review queue. Submitting twice is an
/// invalid-state error, not a duplicate history entry.
async fn submit_invoice(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let invoice = get_row(pool, "invoices", &path.invoice_id, "id").await?;
    let property = get_row(pool, "properties", &value_str(&invoice, "property_id"), "id").await?;
    assert_invoice_author(&actor, &property)?;

    if already_submitted(invoice.as_object().and_then(|obj| obj.get("approval_history"))) {
        return Err(AppError::InvalidState(
            "The invoice was already submitted for review.".to_string(),
        ));
    }

    // The containment clause repeats the history check inside the update so
    // two concurrent submits cannot both append a `submitted` entry; the
    // losing side matches zero rows.
    let entry = history_entry("submitted", &actor_id(&actor), None);
    let row = sqlx::query(
        "UPDATE invoices
         SET approval_history = COALESCE(approval_history, '[]'::jsonb) || $1::jsonb,
             updated_at = now()
         WHERE id = $2::uuid
           AND approval_status = 'pending'
           AND NOT COALESCE(approval_history, '[]'::jsonb) @> '[{\"action\": \"submitted\"}]'::jsonb
         RETURNING row_to_json(invoices.*) AS row",
    )
    .bind(json!([entry]))
    .bind(&path.invoice_id)
    .fetch_optional(pool)
    .await
    .map_err(|error| {
        tracing::error!(error = %error, "Invoice submit failed");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    let Some(updated) = row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten())
    else {
        return Err(AppError::InvalidState(
            "The invoice was already submitted or is no longer awaiting review.".to_string(),
        ));
    };

    write_audit_log(
        Some(pool),
        Some(&actor_id(&actor)),
        "invoice_submitted",
        "invoices",
        &path.invoice_id,
        Some(&invoice),
        Some(&updated),
    )
    .await;

    notify_submission(&state, &actor, &property, &updated).await;

    Ok(Json(json!({ "data": updated })))
}

async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoicesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(approval_status) = non_empty_opt(query.approval_status.as_deref()) {
        filters.insert(
            "approval_status".to_string(),
            Value::String(approval_status),
        );
    }
    if let Some(lease_id) = non_empty_opt(query.lease_id.as_deref()) {
        filters.insert("lease_id".to_string(), Value::String(lease_id));
    }

    match actor_role(&actor).as_str() {
        crate::authz::ROLE_TENANT => {
            filters.insert("tenant_id".to_string(), Value::String(actor_id(&actor)));
            // Tenants never see drafts still being written up.
            if !filters.contains_key("status") {
                filters.insert(
                    "status".to_string(),
                    Value::Array(
                        ["sent", "paid", "overdue"]
                            .iter()
                            .map(|status| Value::String((*status).to_string()))
                            .collect(),
                    ),
                );
            }
            if let Some(property_id) = non_empty_opt(query.property_id.as_deref()) {
                filters.insert("property_id".to_string(), Value::String(property_id));
            }
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

    let mut rows = list_rows(
        pool,
        "invoices",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        query.offset.max(0),
        "created_at",
        false,
    )
    .await?;

    for row in &mut rows {
        enrich_invoice(row);
    }
    Ok(Json(json!({ "data": rows })))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let mut invoice = get_row(pool, "invoices", &path.invoice_id, "id").await?;
    assert_record_access(&state, &actor, &invoice).await?;
    if actor_role(&actor) == crate::authz::ROLE_TENANT
        && value_str(&invoice, "status") == "draft"
    {
        return Err(AppError::NotFound("invoices record not found.".to_string()));
    }

    enrich_invoice(&mut invoice);
    Ok(Json(json!({ "data": invoice })))
}

/// Derived convenience field on every invoice read.
fn enrich_invoice(invoice: &mut Value) {
    let total = number_of(invoice, "total_amount");
    let paid = number_of(invoice, "paid_amount");
    if let Some(obj) = invoice.as_object_mut() {
        obj.insert(
            "outstanding_amount".to_string(),
            json!(outstanding_amount(total, paid)),
        );
    }
}

/// Invoices are authored by staff or the property's landlord; tenants are
/// on the receiving end only.
fn assert_invoice_author(actor: &Value, property: &Value) -> AppResult<()> {
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

async fn notify_submission(state: &AppState, actor: &Value, property: &Value, invoice: &Value) {
    let Ok(pool) = db_pool(state) else {
        return;
    };
    let recipients = match resolve_approver_recipients(
        pool,
        property,
        crate::authz::PERM_APPROVE_INVOICES,
    )
    .await
    {
        Ok(recipients) if !recipients.is_empty() => recipients,
        Ok(_) => return,
        Err(error) => {
            tracing::warn!(error = %error, "Could not resolve approver recipients");
            return;
        }
    };

    let invoice_number = value_str(invoice, "invoice_number");
    let emitted = emit_event(
        pool,
        EmitNotificationEventInput {
            event_type: "invoice_submitted".to_string(),
            title: "Invoice awaiting review".to_string(),
            body: format!("Invoice {invoice_number} was submitted for review."),
            related: Some((RelatedKind::Invoice, value_str(invoice, "id"))),
            actor_user_id: Some(actor_id(actor)),
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
            tracing::warn!(error = %error, "Invoice submission notification failed");
        }
    }
}

fn number_of(row: &Value, key: &str) -> f64 {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
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

    use crate::services::approvals::already_submitted;

    // The update's jsonb containment clause and this pre-check both key on
    // the entry's `action` field; real entries carry more fields than the
    // object the clause matches against.
    #[test]
    fn submit_guard_recognizes_full_history_entries() {
        let history = json!([{
            "action": "submitted",
            "user": "landlord-1",
            "notes": null,
            "timestamp": "2026-03-01T12:00:00+00:00",
        }]);
        assert!(already_submitted(Some(&history)));

        let unsubmitted = json!([{"action": "approved", "user": "reviewer-1"}]);
        assert!(!already_submitted(Some(&unsubmitted)));
        assert!(!already_submitted(None));
    }
}
