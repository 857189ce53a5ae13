use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    authz::{
        actor_id, actor_role, assert_approver, is_staff, load_actor, PERM_APPROVE_PAYMENTS,
        ROLE_LANDLORD, ROLE_TENANT,
    },
    error::{AppError, AppResult},
    repository::table_service::{create_row, get_row, list_rows},
    schemas::{
        clamp_limit_in_range, validate_input, CreatePaymentInput, PaymentPath, PaymentsQuery,
    },
    services::{
        approvals::{history_entry, ApprovalAction, ReviewKind},
        audit::write_audit_log,
        ledger::{late_payment_for, round2},
        notification_center::{
            deliver_event, emit_event, resolve_approver_recipients, EmitNotificationEventInput,
            RelatedKind,
        },
    },
    state::AppState,
};

use super::approvals::execute_review;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/payments",
            axum::routing::get(list_payments).post(create_payment),
        )
        .route("/payments/{payment_id}", axum::routing::get(get_payment))
}

/// Record a payment and submit it for review in one step. Tenants submit for
/// themselves; staff and the owning landlord can submit on a tenant's
/// behalf. `auto_approve` additionally runs the approval transition when the
/// caller is authorized to review payments on the property.
async fn create_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreatePaymentInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let property = get_row(pool, "properties", &input.property_id, "id").await?;
    match actor_role(&actor).as_str() {
        ROLE_TENANT => {
            if input.tenant_id != actor_id(&actor) {
                return Err(AppError::Forbidden(
                    "Tenants can only submit their own payments.".to_string(),
                ));
            }
        }
        ROLE_LANDLORD => {
            if value_str(&property, "landlord_id") != actor_id(&actor) {
                return Err(AppError::Forbidden("Access denied.".to_string()));
            }
        }
        _ => {}
    }

    // Auto-approval is authorized up front so a denied caller leaves no
    // created payment or approver notification behind.
    if input.auto_approve {
        assert_approver(&actor, &property, PERM_APPROVE_PAYMENTS)?;
    }

    if let Some(expected) = input.expected_amount {
        if (round2(expected) - round2(input.amount)).abs() > 0.005 {
            return Err(AppError::Validation(format!(
                "Amount {} does not match the expected amount {}.",
                round2(input.amount),
                round2(expected)
            )));
        }
    }

    if let Some(invoice_id) = non_empty_opt(input.invoice_id.as_deref()) {
        let invoice = get_row(pool, "invoices", &invoice_id, "id").await?;
        if value_str(&invoice, "tenant_id") != input.tenant_id {
            return Err(AppError::Validation(
                "The invoice belongs to a different tenant.".to_string(),
            ));
        }
        if value_str(&invoice, "property_id") != input.property_id {
            return Err(AppError::Validation(
                "The invoice belongs to a different property.".to_string(),
            ));
        }
    }
    if let Some(lease_id) = non_empty_opt(input.lease_id.as_deref()) {
        let lease = get_row(pool, "leases", &lease_id, "id").await?;
        if value_str(&lease, "tenant_id") != input.tenant_id {
            return Err(AppError::Validation(
                "The lease belongs to a different tenant.".to_string(),
            ));
        }
    }

    let today = Utc::now()
        .with_timezone(&state.config.operating_timezone)
        .date_naive();
    let payment_date = non_empty_opt(input.payment_date.as_deref())
        .unwrap_or_else(|| today.to_string());
    let due_date = non_empty_opt(input.due_date.as_deref())
        .and_then(|raw| raw.parse::<chrono::NaiveDate>().ok());

    let mut record = Map::new();
    record.insert("amount".to_string(), json!(round2(input.amount)));
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
    if let Some(invoice_id) = non_empty_opt(input.invoice_id.as_deref()) {
        record.insert("invoice_id".to_string(), Value::String(invoice_id));
    }
    record.insert(
        "payment_method".to_string(),
        Value::String(input.payment_method.clone()),
    );
    record.insert(
        "payment_type".to_string(),
        Value::String(input.payment_type.clone()),
    );
    record.insert("payment_date".to_string(), Value::String(payment_date));
    if let Some(due) = due_date {
        record.insert("due_date".to_string(), Value::String(due.to_string()));
    }
    if let Some(reference) = non_empty_opt(input.reference_number.as_deref()) {
        record.insert("reference_number".to_string(), Value::String(reference));
    }
    if let Some(notes) = non_empty_opt(input.notes.as_deref()) {
        record.insert("notes".to_string(), Value::String(notes));
    }
    record.insert("status".to_string(), Value::String("pending".to_string()));
    record.insert(
        "approval_status".to_string(),
        Value::String("pending".to_string()),
    );
    // Payments submit at creation time, unlike invoices which draft first.
    record.insert(
        "approval_history".to_string(),
        Value::Array(vec![history_entry("submitted", &actor_id(&actor), None)]),
    );
    record.insert(
        "late_payment".to_string(),
        late_payment_for(due_date, today),
    );

    let created = create_row(pool, "payments", &record).await?;
    let payment_id = value_str(&created, "id");

    write_audit_log(
        Some(pool),
        Some(&actor_id(&actor)),
        "payment_submitted",
        "payments",
        &payment_id,
        None,
        Some(&created),
    )
    .await;

    notify_submission(&state, &actor, &property, &created).await;

    if input.auto_approve {
        let approved = execute_review(
            &state,
            &actor,
            ReviewKind::Payment,
            &created,
            ApprovalAction::Approve,
            Some("Auto-approved at submission."),
        )
        .await?;
        return Ok(Json(json!({ "data": approved })));
    }

    Ok(Json(json!({ "data": created })))
}

async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentsQuery>,
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
        ROLE_TENANT => {
            filters.insert("tenant_id".to_string(), Value::String(actor_id(&actor)));
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

    let rows = list_rows(
        pool,
        "payments",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        query.offset.max(0),
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let pool = db_pool(&state)?;

    let payment = get_row(pool, "payments", &path.payment_id, "id").await?;
    assert_record_access(&state, &actor, &payment).await?;

    Ok(Json(json!({ "data": payment })))
}

/// Row-level access shared by the payment and invoice detail reads: tenants
/// see their own rows, landlords rows on properties they own, staff all.
pub(crate) async fn assert_record_access(
    state: &AppState,
    actor: &Value,
    record: &Value,
) -> AppResult<()> {
    if is_staff(actor) {
        return Ok(());
    }
    match actor_role(actor).as_str() {
        ROLE_TENANT => {
            if value_str(record, "tenant_id") == actor_id(actor) {
                return Ok(());
            }
        }
        ROLE_LANDLORD => {
            let property_id = value_str(record, "property_id");
            if !property_id.is_empty() {
                let pool = db_pool(state)?;
                let property = get_row(pool, "properties", &property_id, "id").await?;
                if value_str(&property, "landlord_id") == actor_id(actor) {
                    return Ok(());
                }
            }
        }
        _ => {}
    }
    Err(AppError::Forbidden("Access denied.".to_string()))
}

pub(crate) async fn owned_property_ids(
    pool: &sqlx::PgPool,
    landlord_id: &str,
) -> AppResult<Vec<String>> {
    let mut filters = Map::new();
    filters.insert(
        "landlord_id".to_string(),
        Value::String(landlord_id.to_string()),
    );
    let properties =
        list_rows(pool, "properties", Some(&filters), 1000, 0, "created_at", true).await?;
    Ok(properties
        .iter()
        .map(|property| value_str(property, "id"))
        .filter(|id| !id.is_empty())
        .collect())
}

async fn notify_submission(state: &AppState, actor: &Value, property: &Value, payment: &Value) {
    let Ok(pool) = db_pool(state) else {
        return;
    };
    let recipients = match resolve_approver_recipients(pool, property, PERM_APPROVE_PAYMENTS).await
    {
        Ok(recipients) if !recipients.is_empty() => recipients,
        Ok(_) => return,
        Err(error) => {
            tracing::warn!(error = %error, "Could not resolve approver recipients");
            return;
        }
    };

    let payment_id = value_str(payment, "id");
    let amount = payment
        .as_object()
        .and_then(|obj| obj.get("amount"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let emitted = emit_event(
        pool,
        EmitNotificationEventInput {
            event_type: "payment_submitted".to_string(),
            title: "Payment awaiting review".to_string(),
            body: format!("A payment of {amount} was submitted for review."),
            related: Some((RelatedKind::Payment, payment_id)),
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
            tracing::warn!(error = %error, "Payment submission notification failed");
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
