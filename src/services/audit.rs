use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool};

use crate::error::AppResult;
use crate::repository::table_service::{create_row, create_row_tx};

/// Best-effort audit write. Review decisions and sweeps call this after the
/// fact; a failed audit insert is logged and swallowed so it never undoes
/// the work it describes.
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    actor_user_id: Option<&str>,
    action: &str,
    table_name: &str,
    record_id: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) {
    let Some(pool) = pool else {
        return;
    };
    let record = audit_record(actor_user_id, action, table_name, record_id, before, after);
    if let Err(error) = create_row(pool, "audit_logs", &record).await {
        tracing::warn!(error = %error, action, table_name, "Audit log write failed");
    }
}

/// Audit write inside the caller's transaction. Approval transitions use
/// this so the decision and its audit row commit or roll back together.
pub async fn write_audit_log_tx(
    conn: &mut PgConnection,
    actor_user_id: Option<&str>,
    action: &str,
    table_name: &str,
    record_id: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> AppResult<()> {
    let record = audit_record(actor_user_id, action, table_name, record_id, before, after);
    create_row_tx(conn, "audit_logs", &record).await?;
    Ok(())
}

fn audit_record(
    actor_user_id: Option<&str>,
    action: &str,
    table_name: &str,
    record_id: &str,
    before: Option<&Value>,
    after: Option<&Value>,
) -> Map<String, Value> {
    let mut record = Map::new();
    if let Some(actor) = actor_user_id
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        record.insert(
            "actor_user_id".to_string(),
            Value::String(actor.to_string()),
        );
    }
    record.insert("action".to_string(), Value::String(action.to_string()));
    record.insert(
        "table_name".to_string(),
        Value::String(table_name.to_string()),
    );
    record.insert(
        "record_id".to_string(),
        Value::String(record_id.to_string()),
    );
    record.insert(
        "before_state".to_string(),
        before.cloned().unwrap_or(Value::Null),
    );
    record.insert(
        "after_state".to_string(),
        after.cloned().unwrap_or(Value::Null),
    );
    record
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::audit_record;

    #[test]
    fn builds_a_complete_record() {
        let before = json!({"approval_status": "pending"});
        let after = json!({"approval_status": "approved"});
        let record = audit_record(
            Some("user-1"),
            "payment_approved",
            "payments",
            "pay-1",
            Some(&before),
            Some(&after),
        );
        assert_eq!(record["actor_user_id"], "user-1");
        assert_eq!(record["action"], "payment_approved");
        assert_eq!(record["table_name"], "payments");
        assert_eq!(record["record_id"], "pay-1");
        assert_eq!(record["before_state"]["approval_status"], "pending");
        assert_eq!(record["after_state"]["approval_status"], "approved");
    }

    #[test]
    fn omits_the_actor_for_automatic_actions() {
        let record = audit_record(None, "invoice_overdue", "invoices", "inv-1", None, None);
        assert!(!record.contains_key("actor_user_id"));
        assert_eq!(record["before_state"], Value::Null);

        let blank = audit_record(Some("  "), "x", "payments", "p", None, None);
        assert!(!blank.contains_key("actor_user_id"));
    }
}
