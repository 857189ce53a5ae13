use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::repository::table_service::get_row;
use crate::state::AppState;

pub const ROLE_TENANT: &str = "tenant";
pub const ROLE_LANDLORD: &str = "landlord";
pub const ROLE_MANAGER: &str = "manager";
pub const ROLE_ADMIN: &str = "admin";

pub const PERM_APPROVE_PAYMENTS: &str = "approve_payments";
pub const PERM_APPROVE_INVOICES: &str = "approve_invoices";
pub const PERM_MANAGE_REQUESTS: &str = "manage_requests";

/// Load the verified caller's profile row. A token that verifies but has no
/// profile is treated as unauthenticated, not as a 404.
pub async fn load_actor(state: &AppState, user_id: &str) -> AppResult<Value> {
    let pool = state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })?;

    let actor = match get_row(pool, "users", user_id, "id").await {
        Ok(row) => row,
        Err(AppError::NotFound(_)) => {
            return Err(AppError::Unauthorized("Unknown user.".to_string()));
        }
        Err(error) => return Err(error),
    };

    let active = actor
        .as_object()
        .and_then(|obj| obj.get("is_active"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if !active {
        return Err(AppError::Forbidden("User account is inactive.".to_string()));
    }

    Ok(actor)
}

pub fn actor_id(actor: &Value) -> String {
    value_str(actor, "id")
}

pub fn actor_role(actor: &Value) -> String {
    let role = value_str(actor, "role").to_ascii_lowercase();
    if role.is_empty() {
        ROLE_TENANT.to_string()
    } else {
        role
    }
}

pub fn actor_has_permission(actor: &Value, permission: &str) -> bool {
    actor
        .as_object()
        .and_then(|obj| obj.get("permissions"))
        .and_then(Value::as_array)
        .is_some_and(|permissions| {
            permissions
                .iter()
                .filter_map(Value::as_str)
                .any(|value| value.trim().eq_ignore_ascii_case(permission))
        })
}

pub fn is_admin(actor: &Value) -> bool {
    actor_role(actor) == ROLE_ADMIN
}

pub fn is_staff(actor: &Value) -> bool {
    matches!(actor_role(actor).as_str(), ROLE_MANAGER | ROLE_ADMIN)
}

pub fn assert_admin(actor: &Value) -> AppResult<()> {
    if is_admin(actor) {
        return Ok(());
    }
    Err(AppError::Forbidden("Access denied.".to_string()))
}

pub fn assert_staff(actor: &Value) -> AppResult<()> {
    if is_staff(actor) {
        return Ok(());
    }
    Err(AppError::Forbidden("Access denied.".to_string()))
}

/// Property-scoped approval check shared by the payment and invoice review
/// paths. Admins pass unconditionally; managers need the named permission;
/// landlords must own the property. Returns the property row so callers can
/// reuse it without a second fetch.
pub async fn assert_property_approver(
    state: &AppState,
    actor: &Value,
    property_id: &str,
    required_permission: &str,
) -> AppResult<Value> {
    let pool = state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })?;

    let property = get_row(pool, "properties", property_id, "id").await?;
    assert_approver(actor, &property, required_permission)?;
    Ok(property)
}

/// The approver decision on an already-fetched property row. Callers that
/// hold the property run this before any write.
pub fn assert_approver(actor: &Value, property: &Value, required_permission: &str) -> AppResult<()> {
    match actor_role(actor).as_str() {
        ROLE_ADMIN => Ok(()),
        ROLE_MANAGER if actor_has_permission(actor, required_permission) => Ok(()),
        ROLE_LANDLORD => {
            let owner = value_str(property, "landlord_id");
            if !owner.is_empty() && owner == actor_id(actor) {
                Ok(())
            } else {
                Err(AppError::Forbidden("Access denied.".to_string()))
            }
        }
        _ => Err(AppError::Forbidden("Access denied.".to_string())),
    }
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
    use serde_json::json;

    use super::{
        actor_has_permission, actor_role, assert_approver, assert_staff, is_admin,
        PERM_APPROVE_PAYMENTS,
    };

    #[test]
    fn reads_role_with_tenant_default() {
        assert_eq!(actor_role(&json!({"role": "Landlord"})), "landlord");
        assert_eq!(actor_role(&json!({"role": "  "})), "tenant");
        assert_eq!(actor_role(&json!({})), "tenant");
        assert!(is_admin(&json!({"role": "admin"})));
        assert!(!is_admin(&json!({"role": "manager"})));
    }

    #[test]
    fn permission_check_is_case_insensitive_and_strict() {
        let actor = json!({"permissions": ["approve_payments", " Approve_Invoices "]});
        assert!(actor_has_permission(&actor, "approve_payments"));
        assert!(actor_has_permission(&actor, "approve_invoices"));
        assert!(!actor_has_permission(&actor, "manage_requests"));
        assert!(!actor_has_permission(&json!({}), "approve_payments"));
        assert!(!actor_has_permission(
            &json!({"permissions": "approve_payments"}),
            "approve_payments"
        ));
    }

    #[test]
    fn approver_check_denies_before_any_role_but_an_authorized_one() {
        let property = json!({"id": "prop-1", "landlord_id": "landlord-1"});

        assert!(assert_approver(
            &json!({"id": "a", "role": "admin"}),
            &property,
            PERM_APPROVE_PAYMENTS
        )
        .is_ok());
        assert!(assert_approver(
            &json!({"id": "m", "role": "manager", "permissions": ["approve_payments"]}),
            &property,
            PERM_APPROVE_PAYMENTS
        )
        .is_ok());
        assert!(assert_approver(
            &json!({"id": "landlord-1", "role": "landlord"}),
            &property,
            PERM_APPROVE_PAYMENTS
        )
        .is_ok());

        // A tenant asking for auto-approval and a non-owning landlord both
        // fail here, before any row is written.
        assert!(assert_approver(
            &json!({"id": "tenant-1", "role": "tenant"}),
            &property,
            PERM_APPROVE_PAYMENTS
        )
        .is_err());
        assert!(assert_approver(
            &json!({"id": "landlord-2", "role": "landlord"}),
            &property,
            PERM_APPROVE_PAYMENTS
        )
        .is_err());
        assert!(assert_approver(
            &json!({"id": "m", "role": "manager", "permissions": []}),
            &property,
            PERM_APPROVE_PAYMENTS
        )
        .is_err());
        assert!(assert_approver(
            &json!({"id": "landlord-1", "role": "landlord"}),
            &json!({"id": "prop-2"}),
            PERM_APPROVE_PAYMENTS
        )
        .is_err());
    }

    #[test]
    fn staff_assertion_covers_manager_and_admin() {
        assert!(assert_staff(&json!({"role": "manager"})).is_ok());
        assert!(assert_staff(&json!({"role": "admin"})).is_ok());
        assert!(assert_staff(&json!({"role": "landlord"})).is_err());
        assert!(assert_staff(&json!({"role": "tenant"})).is_err());
    }
}
