use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    auth::require_user_id,
    authz::{actor_id, assert_property_approver, is_admin, load_actor},
    error::{AppError, AppResult},
    repository::table_service::get_row,
    schemas::{ApprovalPath, ReviewActionInput},
    services::{
        approvals::{apply_action, ApprovalAction, ApprovalStatus, ReviewKind},
        audit::write_audit_log_tx,
        identifiers::{generate_receipt_number, ReceiptNumberStore},
        ledger::post_payment_effects,
        notification_center::{
            deliver_event, emit_event, resolve_approver_recipients, EmitNotificationEventInput,
            NotificationRecipient, RelatedKind,
        },
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route(
        "/approvals/{review_kind}/{record_id}",
        axum::routing::post(review_record),
    )
}

/// One endpoint for every approval transition on payments and invoices.
/// Review actions are property-scoped; resubmit belongs to the submitter.
async fn review_record(
    State(state): State<AppState>,
    Path(path): Path<ApprovalPath>,
    headers: HeaderMap,
    Json(input): Json<ReviewActionInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let actor = load_actor(&state, &user_id).await?;
    let kind = ReviewKind::parse(&path.review_kind)?;
    let action = ApprovalAction::parse(&input.action)?;
    let pool = db_pool(&state)?;

    let record = get_row(pool, kind.table(), &path.record_id, "id").await?;

    match action {
        ApprovalAction::Approve | ApprovalAction::Reject | ApprovalAction::RequestChanges => {
            let property_id = value_str(&record, "property_id");
            if property_id.is_empty() {
                return Err(AppError::Internal(
                    "Record is not linked to a property.".to_string(),
                ));
            }
            assert_property_approver(&state, &actor, &property_id, kind.required_permission())
                .await?;
        }
        ApprovalAction::Resubmit => {
            let submitter = submitted_by(&record);
            if submitter != actor_id(&actor) && !is_admin(&actor) {
                return Err(AppError::Forbidden("Access denied.".to_string()));
            }
        }
    }

    let updated =
        execute_review(&state, &actor, kind, &record, action, input.notes.as_deref()).await?;
    Ok(Json(json!({ "data": updated })))
}

/// Run the approval state machine and persist its outcome in one
/// transaction. Shared with the payment auto-approve path; the caller has
/// already authorized the actor for this action.
pub(crate) async fn execute_review(
    state: &AppState,
    actor: &Value,
    kind: ReviewKind,
    record: &Value,
    action: ApprovalAction,
    notes: Option<&str>,
) -> AppResult<Value> {
    let pool = db_pool(state)?;
    let record_id = value_str(record, "id");
    let reviewer = actor_id(actor);

    let current = ApprovalStatus::parse(&value_str(record, "approval_status"))?;
    let outcome = apply_action(kind, current, action, &reviewer, notes)?;

    // Receipt numbers are issued exactly once, at the first approval. The
    // generator runs before the transaction so its retry loop never holds
    // row locks.
    let receipt_number = if kind == ReviewKind::Payment
        && action == ApprovalAction::Approve
        && value_str(record, "receipt_number").is_empty()
    {
        Some(
            generate_receipt_number(
                &ReceiptNumberStore(pool),
                state.config.operating_timezone,
                state.config.identifier_max_attempts,
            )
            .await?,
        )
    } else {
        None
    };

    let rejection_reason = match action {
        ApprovalAction::Reject => notes
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned),
        _ => None,
    };

    let mut tx = pool.begin().await.map_err(map_tx_error)?;

    // Optimistic guard: the row must still hold the approval status the
    // machine evaluated. The losing side of a race matches zero rows.
    let receipt_clause = if kind == ReviewKind::Payment {
        "receipt_number = COALESCE(receipt_number, $6::text),"
    } else {
        ""
    };
    let sql = format!(
        "UPDATE {table}
         SET approval_status = $1,
             approval_history = COALESCE(approval_history, '[]'::jsonb) || $2::jsonb,
             status = COALESCE($3::text, status),
             rejection_reason = CASE
                 WHEN $4::bool THEN NULL
                 WHEN $5::text IS NOT NULL THEN $5::text
                 ELSE rejection_reason
             END,
             {receipt_clause}
             updated_at = now()
         WHERE id = ${id_bind}::uuid AND approval_status = ${status_bind}
         RETURNING row_to_json({table}.*) AS row",
        table = kind.table(),
        receipt_clause = receipt_clause,
        id_bind = if kind == ReviewKind::Payment { 7 } else { 6 },
        status_bind = if kind == ReviewKind::Payment { 8 } else { 7 },
    );

    let mut query = sqlx::query(&sql)
        .bind(outcome.next_status.as_str())
        .bind(json!([outcome.history_entry]))
        .bind(outcome.lifecycle_status)
        .bind(outcome.clears_rejection_reason)
        .bind(rejection_reason);
    if kind == ReviewKind::Payment {
        query = query.bind(receipt_number.as_deref());
    }
    let row = query
        .bind(&record_id)
        .bind(current.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_tx_error)?;

    let Some(updated) = row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten())
    else {
        return Err(AppError::InvalidState(
            "The record was reviewed concurrently. Reload and try again.".to_string(),
        ));
    };

    if kind == ReviewKind::Payment && action == ApprovalAction::Approve {
        post_payment_effects(&mut tx, &updated, state.config.operating_timezone).await?;
    }

    write_audit_log_tx(
        &mut tx,
        Some(&reviewer),
        &format!("{}_{}", kind_name(kind), action.history_action()),
        kind.table(),
        &record_id,
        Some(record),
        Some(&updated),
    )
    .await?;

    tx.commit().await.map_err(map_tx_error)?;

    notify_review_outcome(state, actor, kind, action, &updated).await;

    Ok(updated)
}

/// Post-commit fan-out. The decision already stands; a notification failure
/// is logged and dropped.
async fn notify_review_outcome(
    state: &AppState,
    actor: &Value,
    kind: ReviewKind,
    action: ApprovalAction,
    record: &Value,
) {
    let Ok(pool) = db_pool(state) else {
        return;
    };
    let record_id = value_str(record, "id");
    let reviewer = actor_id(actor);

    let recipients = match action {
        ApprovalAction::Resubmit => {
            let property_id = value_str(record, "property_id");
            if property_id.is_empty() {
                return;
            }
            let Ok(property) = get_row(pool, "properties", &property_id, "id").await else {
                return;
            };
            match resolve_approver_recipients(pool, &property, kind.required_permission()).await {
                Ok(recipients) => recipients,
                Err(error) => {
                    tracing::warn!(error = %error, "Could not resolve approver recipients");
                    return;
                }
            }
        }
        _ => {
            let tenant_id = value_str(record, "tenant_id");
            if tenant_id.is_empty() {
                return;
            }
            vec![NotificationRecipient {
                user_id: tenant_id,
                action_required: !matches!(action, ApprovalAction::Approve),
                priority: "normal".to_string(),
            }]
        }
    };
    if recipients.is_empty() {
        return;
    }

    let (related_kind, label) = match kind {
        ReviewKind::Payment => (RelatedKind::Payment, "Payment"),
        ReviewKind::Invoice => (RelatedKind::Invoice, "Invoice"),
    };
    let (title, body) = match action {
        ApprovalAction::Approve => (
            format!("{label} approved"),
            format!("Your {} was approved.", kind_name(kind)),
        ),
        ApprovalAction::Reject => (
            format!("{label} rejected"),
            format!(
                "Your {} was rejected. You can address the reason and resubmit.",
                kind_name(kind)
            ),
        ),
        ApprovalAction::RequestChanges => (
            format!("{label} needs changes"),
            format!("A reviewer requested changes on your {}.", kind_name(kind)),
        ),
        ApprovalAction::Resubmit => (
            format!("{label} resubmitted"),
            format!("A {} is back in your review queue.", kind_name(kind)),
        ),
    };

    let emitted = emit_event(
        pool,
        EmitNotificationEventInput {
            event_type: format!("{}_{}", kind_name(kind), action.history_action()),
            title,
            body,
            related: Some((related_kind, record_id)),
            actor_user_id: Some(reviewer),
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
            tracing::warn!(error = %error, "Review notification emit failed");
        }
    }
}

/// The submitter recorded in the approval history, falling back to the
/// tenant on the record for rows created before history tracking.
fn submitted_by(record: &Value) -> String {
    let from_history = record
        .as_object()
        .and_then(|obj| obj.get("approval_history"))
        .and_then(Value::as_array)
        .and_then(|entries| {
            entries.iter().find(|entry| {
                entry
                    .as_object()
                    .and_then(|obj| obj.get("action"))
                    .and_then(Value::as_str)
                    .is_some_and(|value| value == "submitted")
            })
        })
        .map(|entry| value_str(entry, "user"))
        .unwrap_or_default();
    if !from_history.is_empty() {
        return from_history;
    }
    value_str(record, "tenant_id")
}

fn kind_name(kind: ReviewKind) -> &'static str {
    match kind {
        ReviewKind::Payment => "payment",
        ReviewKind::Invoice => "invoice",
    }
}

fn map_tx_error(error: sqlx::Error) -> AppError {
    tracing::error!(error = %error, "Approval transaction failed");
    AppError::Dependency("Database operation failed.".to_string())
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
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

    use super::submitted_by;

    #[test]
    fn reads_the_submitter_from_history() {
        let record = json!({
            "tenant_id": "tenant-1",
            "approval_history": [
                {"action": "submitted", "user": "user-9"},
                {"action": "rejected", "user": "reviewer-1"},
            ],
        });
        assert_eq!(submitted_by(&record), "user-9");
    }

    #[test]
    fn falls_back_to_the_tenant_without_history() {
        let record = json!({"tenant_id": "tenant-1", "approval_history": []});
        assert_eq!(submitted_by(&record), "tenant-1");
        assert_eq!(submitted_by(&json!({"tenant_id": "tenant-2"})), "tenant-2");
    }
}
