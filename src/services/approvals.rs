use chrono::Utc;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};

/// Tri-state approval vocabulary, distinct from the broader lifecycle
/// `status` column on payments and invoices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(AppError::Internal(format!(
                "Unknown approval status '{other}' on stored record."
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Approve,
    Reject,
    RequestChanges,
    Resubmit,
}

impl ApprovalAction {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "request_changes" => Ok(Self::RequestChanges),
            "resubmit" => Ok(Self::Resubmit),
            other => Err(AppError::Validation(format!(
                "Unknown approval action '{other}'. Expected approve, reject, request_changes or resubmit."
            ))),
        }
    }

    /// The verb recorded in the append-only approval history.
    pub fn history_action(self) -> &'static str {
        match self {
            Self::Approve => "approved",
            Self::Reject => "rejected",
            Self::RequestChanges => "changes_requested",
            Self::Resubmit => "resubmitted",
        }
    }
}

/// Which review queue a record belongs to. Approving a payment and approving
/// an invoice share the machine but differ in lifecycle side effects and in
/// the permission a manager must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewKind {
    Payment,
    Invoice,
}

impl ReviewKind {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "payment" => Ok(Self::Payment),
            "invoice" => Ok(Self::Invoice),
            other => Err(AppError::Validation(format!(
                "Unknown review type '{other}'. Expected payment or invoice."
            ))),
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Payment => "payments",
            Self::Invoice => "invoices",
        }
    }

    pub fn required_permission(self) -> &'static str {
        match self {
            Self::Payment => crate::authz::PERM_APPROVE_PAYMENTS,
            Self::Invoice => crate::authz::PERM_APPROVE_INVOICES,
        }
    }
}

/// Everything a handler needs to persist for one approval transition. The
/// machine never touches the database; the handler owns persistence and
/// wraps it in a single transaction.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub next_status: ApprovalStatus,
    /// Lifecycle `status` to set alongside the approval status, when the
    /// transition changes it (payment completed/failed, invoice sent).
    pub lifecycle_status: Option<&'static str>,
    pub history_entry: Value,
    pub clears_rejection_reason: bool,
}

pub fn can_transition(current: ApprovalStatus, action: ApprovalAction) -> bool {
    match action {
        ApprovalAction::Approve | ApprovalAction::Reject | ApprovalAction::RequestChanges => {
            current == ApprovalStatus::Pending
        }
        ApprovalAction::Resubmit => current == ApprovalStatus::Rejected,
    }
}

/// Apply an approval action to the current state. Returns a typed error and
/// no partial outcome when the transition is not eligible; re-approving an
/// approved record is a failure, never a silent no-op.
pub fn apply_action(
    kind: ReviewKind,
    current: ApprovalStatus,
    action: ApprovalAction,
    actor_id: &str,
    notes: Option<&str>,
) -> AppResult<ApprovalOutcome> {
    if !can_transition(current, action) {
        return Err(AppError::InvalidState(format!(
            "Cannot {} a record whose approval status is '{}'.",
            match action {
                ApprovalAction::Approve => "approve",
                ApprovalAction::Reject => "reject",
                ApprovalAction::RequestChanges => "request changes on",
                ApprovalAction::Resubmit => "resubmit",
            },
            current.as_str()
        )));
    }

    let next_status = match action {
        ApprovalAction::Approve => ApprovalStatus::Approved,
        ApprovalAction::Reject => ApprovalStatus::Rejected,
        ApprovalAction::RequestChanges => ApprovalStatus::Pending,
        ApprovalAction::Resubmit => ApprovalStatus::Pending,
    };

    let lifecycle_status = match (kind, action) {
        (ReviewKind::Payment, ApprovalAction::Approve) => Some("completed"),
        (ReviewKind::Payment, ApprovalAction::Reject) => Some("failed"),
        (ReviewKind::Payment, ApprovalAction::Resubmit) => Some("pending"),
        (ReviewKind::Invoice, ApprovalAction::Approve) => Some("sent"),
        // Rejecting an invoice leaves its lifecycle status untouched.
        (ReviewKind::Invoice, ApprovalAction::Reject) => None,
        (ReviewKind::Invoice, ApprovalAction::Resubmit) => None,
        (_, ApprovalAction::RequestChanges) => None,
    };

    Ok(ApprovalOutcome {
        next_status,
        lifecycle_status,
        history_entry: history_entry(action.history_action(), actor_id, notes),
        clears_rejection_reason: action == ApprovalAction::Resubmit,
    })
}

/// Audit record shape `{action, user, notes, timestamp}`; entries are only
/// ever appended, never reordered or pruned.
pub fn history_entry(action: &str, actor_id: &str, notes: Option<&str>) -> Value {
    json!({
        "action": action,
        "user": actor_id,
        "notes": notes.map(str::trim).filter(|value| !value.is_empty()),
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// True when the approval history already carries a `submitted` entry.
/// Invoices are created as drafts and enter the queue through an explicit
/// submit; payments submit at creation time.
pub fn already_submitted(history: Option<&Value>) -> bool {
    history
        .and_then(Value::as_array)
        .is_some_and(|entries| {
            entries.iter().any(|entry| {
                entry
                    .as_object()
                    .and_then(|obj| obj.get("action"))
                    .and_then(Value::as_str)
                    .is_some_and(|value| value == "submitted")
            })
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        already_submitted, apply_action, can_transition, ApprovalAction, ApprovalStatus,
        ReviewKind,
    };
    use crate::error::AppError;

    #[test]
    fn only_pending_records_can_be_reviewed() {
        for action in [
            ApprovalAction::Approve,
            ApprovalAction::Reject,
            ApprovalAction::RequestChanges,
        ] {
            assert!(can_transition(ApprovalStatus::Pending, action));
            assert!(!can_transition(ApprovalStatus::Approved, action));
            assert!(!can_transition(ApprovalStatus::Rejected, action));
        }
    }

    #[test]
    fn resubmit_only_reopens_rejected_records() {
        assert!(can_transition(ApprovalStatus::Rejected, ApprovalAction::Resubmit));
        assert!(!can_transition(ApprovalStatus::Pending, ApprovalAction::Resubmit));
        assert!(!can_transition(ApprovalStatus::Approved, ApprovalAction::Resubmit));
    }

    #[test]
    fn approving_an_approved_payment_is_an_invalid_state_error() {
        let error = apply_action(
            ReviewKind::Payment,
            ApprovalStatus::Approved,
            ApprovalAction::Approve,
            "user-1",
            None,
        )
        .unwrap_err();
        assert!(matches!(error, AppError::InvalidState(_)));
    }

    #[test]
    fn payment_approval_completes_the_payment() {
        let outcome = apply_action(
            ReviewKind::Payment,
            ApprovalStatus::Pending,
            ApprovalAction::Approve,
            "user-1",
            Some("looks good"),
        )
        .unwrap();
        assert_eq!(outcome.next_status, ApprovalStatus::Approved);
        assert_eq!(outcome.lifecycle_status, Some("completed"));
        assert_eq!(outcome.history_entry["action"], "approved");
        assert_eq!(outcome.history_entry["user"], "user-1");
        assert_eq!(outcome.history_entry["notes"], "looks good");
        assert!(!outcome.clears_rejection_reason);
    }

    #[test]
    fn payment_rejection_fails_the_payment_but_invoice_status_is_untouched() {
        let payment = apply_action(
            ReviewKind::Payment,
            ApprovalStatus::Pending,
            ApprovalAction::Reject,
            "user-1",
            Some("wrong amount"),
        )
        .unwrap();
        assert_eq!(payment.lifecycle_status, Some("failed"));

        let invoice = apply_action(
            ReviewKind::Invoice,
            ApprovalStatus::Pending,
            ApprovalAction::Reject,
            "user-1",
            None,
        )
        .unwrap();
        assert_eq!(invoice.next_status, ApprovalStatus::Rejected);
        assert_eq!(invoice.lifecycle_status, None);
    }

    #[test]
    fn invoice_approval_moves_it_to_sent() {
        let outcome = apply_action(
            ReviewKind::Invoice,
            ApprovalStatus::Pending,
            ApprovalAction::Approve,
            "user-1",
            None,
        )
        .unwrap();
        assert_eq!(outcome.lifecycle_status, Some("sent"));
    }

    #[test]
    fn request_changes_keeps_the_record_pending_with_a_history_entry() {
        let outcome = apply_action(
            ReviewKind::Payment,
            ApprovalStatus::Pending,
            ApprovalAction::RequestChanges,
            "user-2",
            Some("attach the bank slip"),
        )
        .unwrap();
        assert_eq!(outcome.next_status, ApprovalStatus::Pending);
        assert_eq!(outcome.lifecycle_status, None);
        assert_eq!(outcome.history_entry["action"], "changes_requested");
    }

    #[test]
    fn resubmit_returns_to_pending_and_clears_the_rejection() {
        let outcome = apply_action(
            ReviewKind::Payment,
            ApprovalStatus::Rejected,
            ApprovalAction::Resubmit,
            "user-3",
            None,
        )
        .unwrap();
        assert_eq!(outcome.next_status, ApprovalStatus::Pending);
        assert_eq!(outcome.lifecycle_status, Some("pending"));
        assert!(outcome.clears_rejection_reason);
        assert_eq!(outcome.history_entry["action"], "resubmitted");
        assert_eq!(outcome.history_entry["notes"], serde_json::Value::Null);
    }

    #[test]
    fn parses_stored_vocabulary_and_rejects_drift() {
        assert_eq!(
            ApprovalStatus::parse(" Pending ").unwrap(),
            ApprovalStatus::Pending
        );
        assert_eq!(ApprovalStatus::parse("").unwrap(), ApprovalStatus::Pending);
        assert!(ApprovalStatus::parse("COMPLETED").is_err());
        assert!(ApprovalAction::parse("escalate").is_err());
        assert!(ReviewKind::parse("lease").is_err());
        assert_eq!(ReviewKind::parse("invoice").unwrap().table(), "invoices");
    }

    #[test]
    fn detects_prior_submission_in_history() {
        assert!(already_submitted(Some(&json!([
            {"action": "submitted", "user": "u", "timestamp": "t"}
        ]))));
        assert!(!already_submitted(Some(&json!([]))));
        assert!(!already_submitted(Some(&json!([
            {"action": "approved", "user": "u"}
        ]))));
        assert!(!already_submitted(None));
    }
}
