use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::Validation(format!("Validation failed: {errors}")))
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

fn default_false() -> bool {
    false
}
fn default_quantity() -> f64 {
    1.0
}
fn default_zero() -> f64 {
    0.0
}
fn default_limit_100() -> i64 {
    100
}
fn default_limit_50() -> i64 {
    50
}
fn default_payment_type_rent() -> String {
    "rent".to_string()
}
fn default_payment_due_day() -> i32 {
    1
}

// ---------- Payments ----------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePaymentInput {
    #[validate(range(min = 0.01))]
    pub amount: f64,
    pub tenant_id: String,
    pub property_id: String,
    pub lease_id: Option<String>,
    pub invoice_id: Option<String>,
    #[validate(length(min = 1, max = 50))]
    pub payment_method: String,
    #[serde(default = "default_payment_type_rent")]
    pub payment_type: String,
    pub payment_date: Option<String>,
    pub due_date: Option<String>,
    pub reference_number: Option<String>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    /// Approve in the same request when the caller is authorized to review
    /// payments on this property.
    #[serde(default = "default_false")]
    pub auto_approve: bool,
    pub expected_amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentsQuery {
    pub status: Option<String>,
    pub approval_status: Option<String>,
    pub tenant_id: Option<String>,
    pub property_id: Option<String>,
    pub lease_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentPath {
    pub payment_id: String,
}

// ---------- Invoices ----------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct LineItemInput {
    #[validate(length(min = 1, max = 500))]
    pub description: String,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
    pub unit_price: f64,
    /// Recomputed server-side from quantity and unit price when absent.
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateInvoiceInput {
    pub tenant_id: String,
    pub property_id: String,
    pub lease_id: Option<String>,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub line_items: Vec<LineItemInput>,
    #[serde(default = "default_zero")]
    pub tax_amount: f64,
    pub due_date: String,
    pub issue_date: Option<String>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct InvoicesQuery {
    pub status: Option<String>,
    pub approval_status: Option<String>,
    pub tenant_id: Option<String>,
    pub property_id: Option<String>,
    pub lease_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct InvoicePath {
    pub invoice_id: String,
}

// ---------- Approvals ----------

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReviewActionInput {
    pub action: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ApprovalPath {
    pub review_kind: String,
    pub record_id: String,
}

// ---------- Leases ----------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateLeaseInput {
    pub tenant_id: String,
    pub property_id: String,
    pub property_request_id: Option<String>,
    pub start_date: String,
    pub end_date: Option<String>,
    #[validate(range(min = 0.01))]
    pub monthly_rent: f64,
    #[serde(default = "default_zero")]
    pub security_deposit: f64,
    /// Day of month rent falls due. Capped at 28 so every month has one.
    #[serde(default = "default_payment_due_day")]
    #[validate(range(min = 1, max = 28))]
    pub payment_due_day: i32,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeasesQuery {
    pub status: Option<String>,
    pub tenant_id: Option<String>,
    pub property_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LeasePath {
    pub lease_id: String,
}

// ---------- Property requests ----------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePropertyRequestInput {
    /// Required except for `new_property` requests, which describe the
    /// wanted property instead.
    pub property_id: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub request_type: String,
    pub requested_property_details: Option<serde_json::Value>,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    pub preferred_move_in_date: Option<String>,
    /// Optional opening message for the request thread.
    #[validate(length(max = 5000))]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PropertyRequestsQuery {
    pub status: Option<String>,
    pub property_id: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PropertyRequestPath {
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct PropertyRequestActionInput {
    pub action: String,
    #[validate(length(max = 5000))]
    pub message: Option<String>,
    #[validate(length(max = 2000))]
    pub note: Option<String>,
    #[validate(length(max = 2000))]
    pub next_steps: Option<String>,
    #[validate(length(max = 2000))]
    pub rejection_reason: Option<String>,
}

// ---------- Notifications ----------

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct NotificationsQuery {
    #[serde(default = "default_false")]
    pub unread_only: bool,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub cursor: Option<String>,
    #[serde(default = "default_limit_50")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct NotificationPath {
    pub notification_id: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateInvoiceInput,
        CreateLeaseInput, CreatePaymentInput,
    };

    #[test]
    fn rejects_non_positive_payment_amounts() {
        let input: CreatePaymentInput = serde_json::from_value(json!({
            "amount": 0.0,
            "tenant_id": "t",
            "property_id": "p",
            "payment_method": "bank_transfer"
        }))
        .unwrap();
        assert!(validate_input(&input).is_err());
    }

    #[test]
    fn payment_defaults_apply() {
        let input: CreatePaymentInput = serde_json::from_value(json!({
            "amount": 1200.0,
            "tenant_id": "t",
            "property_id": "p",
            "payment_method": "cash"
        }))
        .unwrap();
        assert_eq!(input.payment_type, "rent");
        assert!(!input.auto_approve);
        assert!(validate_input(&input).is_ok());
    }

    #[test]
    fn invoices_require_at_least_one_line_item() {
        let input: CreateInvoiceInput = serde_json::from_value(json!({
            "tenant_id": "t",
            "property_id": "p",
            "line_items": [],
            "due_date": "2026-04-01"
        }))
        .unwrap();
        assert!(validate_input(&input).is_err());
    }

    #[test]
    fn lease_due_day_is_capped_at_28() {
        let ok: CreateLeaseInput = serde_json::from_value(json!({
            "tenant_id": "t",
            "property_id": "p",
            "start_date": "2026-04-01",
            "monthly_rent": 1500.0,
            "payment_due_day": 28
        }))
        .unwrap();
        assert!(validate_input(&ok).is_ok());

        let bad: CreateLeaseInput = serde_json::from_value(json!({
            "tenant_id": "t",
            "property_id": "p",
            "start_date": "2026-04-01",
            "monthly_rent": 1500.0,
            "payment_due_day": 31
        }))
        .unwrap();
        assert!(validate_input(&bad).is_err());
    }

    #[test]
    fn map_helpers_round_trip_and_strip_nulls() {
        let input: CreatePaymentInput = serde_json::from_value(json!({
            "amount": 900.0,
            "tenant_id": "t",
            "property_id": "p",
            "payment_method": "cash"
        }))
        .unwrap();
        let map = remove_nulls(serialize_to_map(&input));
        assert_eq!(map["amount"], json!(900.0));
        assert!(!map.contains_key("lease_id"));
        assert!(!map.contains_key("notes"));

        assert_eq!(clamp_limit_in_range(0, 1, 500), 1);
        assert_eq!(clamp_limit_in_range(9999, 1, 500), 500);
    }
}
