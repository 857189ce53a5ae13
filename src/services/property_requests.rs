use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::repository::table_service::list_rows;
use crate::services::notification_center::{
    emit_event, EmitNotificationEventInput, NotificationRecipient, RelatedKind,
};

/// Directed lifecycle of a tenant↔landlord property request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    UnderReview,
    Approved,
    LeaseRequested,
    LeaseActive,
    Rejected,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "pending" => Ok(Self::Pending),
            "under_review" => Ok(Self::UnderReview),
            "approved" => Ok(Self::Approved),
            "lease_requested" => Ok(Self::LeaseRequested),
            "lease_active" => Ok(Self::LeaseActive),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(AppError::Internal(format!(
                "Unknown property request status '{other}' on stored record."
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::LeaseRequested => "lease_requested",
            Self::LeaseActive => "lease_active",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Terminal for tenant- and landlord-initiated transitions. Only the
    /// admin reopen path leaves these states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Cancelled | Self::Expired)
    }
}

/// The directed transition graph. `cancelled` is reachable from any
/// pre-terminal state; `expired` only from `pending` (time-based).
pub fn can_transition(current: RequestStatus, next: RequestStatus) -> bool {
    use RequestStatus as S;
    match (current, next) {
        (S::Pending, S::UnderReview)
        | (S::Pending, S::Approved)
        | (S::UnderReview, S::Approved)
        | (S::Approved, S::LeaseRequested)
        | (S::LeaseRequested, S::LeaseActive) => true,
        (S::Pending | S::UnderReview | S::Approved, S::Rejected) => true,
        (current, S::Cancelled) => !current.is_terminal() && current != S::LeaseActive,
        (S::Pending, S::Expired) => true,
        _ => false,
    }
}

/// Append-only status history entry. `changed_by` is absent for automatic
/// transitions (expiry, lease activation).
pub fn history_entry(
    status: RequestStatus,
    changed_by: Option<&str>,
    note: Option<&str>,
    automatic_change: bool,
) -> Value {
    json!({
        "status": status.as_str(),
        "changed_by": changed_by,
        "note": note.map(str::trim).filter(|value| !value.is_empty()),
        "automatic_change": automatic_change,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Synthetic thread entry summarizing a transition, so the message feed
/// stays the single human-readable history.
pub fn system_message(text: &str) -> Value {
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "sender_id": Value::Null,
        "message": text,
        "message_type": "system",
        "is_read": false,
        "sent_at": Utc::now().to_rfc3339(),
    })
}

pub fn user_message(sender_id: &str, text: &str) -> Value {
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "sender_id": sender_id,
        "message": text,
        "message_type": "user",
        "is_read": false,
        "sent_at": Utc::now().to_rfc3339(),
    })
}

pub fn transition_note(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Pending => "Request reopened and returned to the queue.",
        RequestStatus::UnderReview => "The landlord is reviewing this request.",
        RequestStatus::Approved => "The request was approved.",
        RequestStatus::LeaseRequested => "A lease was drafted from this request.",
        RequestStatus::LeaseActive => "The lease is now active.",
        RequestStatus::Rejected => "The request was rejected.",
        RequestStatus::Cancelled => "The request was cancelled.",
        RequestStatus::Expired => "The request expired without a response.",
    }
}

/// Derived, read-time priority fields. A lapsed `pending` request is treated
/// as expired here so stale rows never surface escalated priorities between
/// sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedPriority {
    pub priority: &'static str,
    pub is_urgent: bool,
    pub lapsed: bool,
}

pub fn derive_priority(
    status: RequestStatus,
    created_at: Option<DateTime<FixedOffset>>,
    expires_at: Option<DateTime<FixedOffset>>,
    now: DateTime<Utc>,
    high_after_days: i64,
    urgent_after_days: i64,
) -> DerivedPriority {
    let lapsed = status == RequestStatus::Pending
        && expires_at.is_some_and(|deadline| now > deadline.with_timezone(&Utc));
    if status != RequestStatus::Pending || lapsed {
        return DerivedPriority {
            priority: "normal",
            is_urgent: false,
            lapsed,
        };
    }

    let age_days = created_at
        .map(|created| (now - created.with_timezone(&Utc)).num_days())
        .unwrap_or(0);

    DerivedPriority {
        priority: if age_days > high_after_days {
            "high"
        } else {
            "normal"
        },
        is_urgent: age_days > urgent_after_days,
        lapsed,
    }
}

/// Attach the derived fields to an API row in place.
pub fn enrich_request_row(row: &mut Value, config: &AppConfig, now: DateTime<Utc>) {
    let Some(obj) = row.as_object_mut() else {
        return;
    };
    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .and_then(|raw| RequestStatus::parse(raw).ok())
        .unwrap_or(RequestStatus::Pending);
    let created_at = parse_iso_datetime(obj.get("created_at"));
    let expires_at = parse_iso_datetime(obj.get("expires_at"));

    let derived = derive_priority(
        status,
        created_at,
        expires_at,
        now,
        config.request_priority_high_after_days,
        config.request_urgent_after_days,
    );
    obj.insert(
        "priority".to_string(),
        Value::String(derived.priority.to_string()),
    );
    obj.insert("is_urgent".to_string(), Value::Bool(derived.is_urgent));
    if derived.lapsed {
        obj.insert("status".to_string(), Value::String("expired".to_string()));
    }
}

pub fn initial_expiry(now: DateTime<Utc>, expiry_days: i64) -> DateTime<Utc> {
    now + Duration::days(expiry_days.max(1))
}

pub fn approval_grace_expiry(now: DateTime<Utc>, grace_days: i64) -> DateTime<Utc> {
    now + Duration::days(grace_days.max(1))
}

/// Counters for one expiry sweep run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RequestExpirySweepResult {
    pub scanned: u32,
    pub transitioned: u32,
    pub notifications_emitted: u32,
    pub errors: u32,
}

/// Expire stale `pending` requests past `expires_at`. Each transition writes
/// an `automatic_change` history entry plus a system message, mirroring what
/// an actor-driven transition would record.
pub async fn run_request_expiry_sweep(
    pool: &PgPool,
    config: &AppConfig,
) -> RequestExpirySweepResult {
    let now = Utc::now();
    let mut result = RequestExpirySweepResult::default();

    let mut filters = Map::new();
    filters.insert("status".to_string(), Value::String("pending".to_string()));
    filters.insert(
        "expires_at__lt".to_string(),
        Value::String(now.to_rfc3339()),
    );

    let requests = match list_rows(
        pool,
        "property_requests",
        Some(&filters),
        500,
        0,
        "expires_at",
        true,
    )
    .await
    {
        Ok(rows) => rows,
        Err(error) => {
            tracing::warn!(error = %error, "Failed to list pending requests for the expiry sweep");
            result.errors += 1;
            return result;
        }
    };

    for request in requests {
        result.scanned += 1;
        let request_id = value_str(&request, "id");
        if request_id.is_empty() {
            continue;
        }

        let entry = history_entry(RequestStatus::Expired, None, None, true);
        let message = system_message(transition_note(RequestStatus::Expired));

        let updated = sqlx::query(
            "UPDATE property_requests
             SET status = 'expired',
                 status_history = COALESCE(status_history, '[]'::jsonb) || $1::jsonb,
                 messages = COALESCE(messages, '[]'::jsonb) || $2::jsonb,
                 updated_at = now()
             WHERE id = $3::uuid
               AND status = 'pending'
               AND expires_at < now()
             RETURNING 1",
        )
        .bind(json!([entry]))
        .bind(json!([message]))
        .bind(&request_id)
        .fetch_optional(pool)
        .await;

        match updated {
            Ok(Some(_)) => {
                result.transitioned += 1;
                let tenant_id = value_str(&request, "tenant_id");
                if tenant_id.is_empty() {
                    continue;
                }
                let emitted = emit_event(
                    pool,
                    EmitNotificationEventInput {
                        event_type: "property_request_expired".to_string(),
                        title: "Property request expired".to_string(),
                        body: "Your property request expired without a landlord response."
                            .to_string(),
                        related: Some((RelatedKind::PropertyRequest, request_id.clone())),
                        actor_user_id: None,
                        payload: Map::new(),
                        dedupe_key: Some(format!("property_request_expired:{request_id}")),
                        recipients: vec![NotificationRecipient {
                            user_id: tenant_id,
                            action_required: false,
                            priority: "normal".to_string(),
                        }],
                    },
                )
                .await;
                if emitted.is_ok() {
                    result.notifications_emitted += 1;
                }
            }
            Ok(None) => {
                // Raced with an actor transition or an earlier sweep run.
            }
            Err(error) => {
                tracing::warn!(error = %error, request_id = %request_id, "Expiry transition failed");
                result.errors += 1;
            }
        }
    }

    tracing::info!(
        scanned = result.scanned,
        transitioned = result.transitioned,
        notifications = result.notifications_emitted,
        errors = result.errors,
        "Property request expiry sweep completed"
    );
    result
}

pub fn parse_iso_datetime(value: Option<&Value>) -> Option<DateTime<FixedOffset>> {
    let mut text = value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)?;
    if text.ends_with('Z') {
        text.truncate(text.len().saturating_sub(1));
        text.push_str("+00:00");
    }
    DateTime::parse_from_rfc3339(&text).ok()
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::Value;

    use super::{
        can_transition, derive_priority, history_entry, parse_iso_datetime, system_message,
        RequestStatus,
    };

    #[test]
    fn happy_path_advances_along_the_graph() {
        use RequestStatus as S;
        assert!(can_transition(S::Pending, S::UnderReview));
        assert!(can_transition(S::UnderReview, S::Approved));
        assert!(can_transition(S::Approved, S::LeaseRequested));
        assert!(can_transition(S::LeaseRequested, S::LeaseActive));
        assert!(can_transition(S::Pending, S::Approved));
    }

    #[test]
    fn rejection_and_cancellation_boundaries() {
        use RequestStatus as S;
        assert!(can_transition(S::Pending, S::Rejected));
        assert!(can_transition(S::UnderReview, S::Rejected));
        assert!(can_transition(S::Approved, S::Rejected));
        assert!(!can_transition(S::LeaseRequested, S::Rejected));

        assert!(can_transition(S::Pending, S::Cancelled));
        assert!(can_transition(S::LeaseRequested, S::Cancelled));
        assert!(!can_transition(S::LeaseActive, S::Cancelled));
        assert!(!can_transition(S::Rejected, S::Cancelled));
    }

    #[test]
    fn terminal_states_admit_no_direct_transitions() {
        use RequestStatus as S;
        for terminal in [S::Rejected, S::Cancelled, S::Expired] {
            assert!(terminal.is_terminal());
            for next in [
                S::Pending,
                S::UnderReview,
                S::Approved,
                S::LeaseRequested,
                S::LeaseActive,
            ] {
                assert!(
                    !can_transition(terminal, next),
                    "{} -> {} must be disallowed",
                    terminal.as_str(),
                    next.as_str()
                );
            }
        }
        // rejected -> approved in particular never happens directly.
        assert!(!can_transition(S::Rejected, S::Approved));
    }

    #[test]
    fn expiry_only_applies_to_pending() {
        use RequestStatus as S;
        assert!(can_transition(S::Pending, S::Expired));
        assert!(!can_transition(S::UnderReview, S::Expired));
        assert!(!can_transition(S::Approved, S::Expired));
    }

    #[test]
    fn priority_escalates_with_age() {
        let now = Utc::now();
        let fresh = (now - Duration::days(2)).fixed_offset();
        let week_old = (now - Duration::days(8)).fixed_offset();
        let fortnight_old = (now - Duration::days(15)).fixed_offset();
        let horizon = (now + Duration::days(10)).fixed_offset();

        let young = derive_priority(RequestStatus::Pending, Some(fresh), Some(horizon), now, 7, 14);
        assert_eq!(young.priority, "normal");
        assert!(!young.is_urgent);

        let aging =
            derive_priority(RequestStatus::Pending, Some(week_old), Some(horizon), now, 7, 14);
        assert_eq!(aging.priority, "high");
        assert!(!aging.is_urgent);

        let stale = derive_priority(
            RequestStatus::Pending,
            Some(fortnight_old),
            Some(horizon),
            now,
            7,
            14,
        );
        assert_eq!(stale.priority, "high");
        assert!(stale.is_urgent);
    }

    #[test]
    fn lapsed_pending_requests_never_escalate() {
        let now = Utc::now();
        let old = (now - Duration::days(40)).fixed_offset();
        let past_deadline = (now - Duration::days(5)).fixed_offset();

        let derived = derive_priority(
            RequestStatus::Pending,
            Some(old),
            Some(past_deadline),
            now,
            7,
            14,
        );
        assert!(derived.lapsed);
        assert_eq!(derived.priority, "normal");
        assert!(!derived.is_urgent);

        let reviewed = derive_priority(RequestStatus::Approved, Some(old), None, now, 7, 14);
        assert_eq!(reviewed.priority, "normal");
        assert!(!reviewed.lapsed);
    }

    #[test]
    fn history_entries_record_the_automatic_flag() {
        let manual = history_entry(RequestStatus::Approved, Some("user-1"), Some("ok"), false);
        assert_eq!(manual["status"], "approved");
        assert_eq!(manual["changed_by"], "user-1");
        assert_eq!(manual["automatic_change"], Value::Bool(false));

        let automatic = history_entry(RequestStatus::Expired, None, None, true);
        assert_eq!(automatic["changed_by"], Value::Null);
        assert_eq!(automatic["automatic_change"], Value::Bool(true));
    }

    #[test]
    fn system_messages_carry_the_system_type() {
        let message = system_message("The request was approved.");
        assert_eq!(message["message_type"], "system");
        assert_eq!(message["sender_id"], Value::Null);
        assert!(!message["id"].as_str().unwrap().is_empty());
    }

    #[test]
    fn parses_row_to_json_timestamps() {
        let value = serde_json::json!("2026-03-01T12:00:00+00:00");
        assert!(parse_iso_datetime(Some(&value)).is_some());
        let zulu = serde_json::json!("2026-03-01T12:00:00Z");
        assert!(parse_iso_datetime(Some(&zulu)).is_some());
        assert!(parse_iso_datetime(Some(&serde_json::json!(""))).is_none());
        assert!(parse_iso_datetime(None).is_none());
    }
}
