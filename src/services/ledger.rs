use chrono::{Months, NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::{json, Map, Value};
use sqlx::{PgConnection, PgPool, Row};

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{list_rows, update_row_tx};
use crate::services::notification_center::{
    emit_event, EmitNotificationEventInput, NotificationRecipient, RelatedKind,
};

/// Derived invoice money fields, recomputed by this named step before every
/// persist. Client-supplied totals are never trusted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvoiceTotals {
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
}

#[derive(Debug, Clone)]
pub struct InvoiceApplication {
    pub paid_amount: f64,
    pub status: String,
    pub payments_entry: Value,
    pub overpaid: bool,
}

#[derive(Debug, Clone)]
pub struct LeaseApplication {
    pub total_paid: f64,
    pub balance_due: f64,
    pub last_payment_date: NaiveDate,
    pub next_payment_due: Option<NaiveDate>,
    pub months_advanced: u32,
}

/// Invoice and lease rows as updated by `post_payment_effects`, for response
/// enrichment and notification payloads.
#[derive(Debug, Clone, Default)]
pub struct PaymentPosting {
    pub invoice: Option<Value>,
    pub lease: Option<Value>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Normalize line items: quantity defaults to 1, amount defaults to
/// quantity x unit_price. Rejects empty descriptions and negative money.
pub fn normalize_line_items(items: &[Value]) -> AppResult<Vec<Value>> {
    if items.is_empty() {
        return Err(AppError::Validation(
            "An invoice requires at least one line item.".to_string(),
        ));
    }

    let mut normalized = Vec::with_capacity(items.len());
    for item in items {
        let obj = item
            .as_object()
            .ok_or_else(|| AppError::Validation("Malformed line item.".to_string()))?;
        let description = obj
            .get("description")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                AppError::Validation("Each line item needs a description.".to_string())
            })?;
        let quantity = number_or(obj.get("quantity"), 1.0);
        let unit_price = number_or(obj.get("unit_price"), 0.0);
        if quantity <= 0.0 || unit_price < 0.0 {
            return Err(AppError::Validation(format!(
                "Line item '{description}' has a non-positive quantity or negative unit price."
            )));
        }
        let amount = match obj.get("amount") {
            Some(value) if !value.is_null() => number_or(Some(value), 0.0),
            _ => round2(quantity * unit_price),
        };
        if amount < 0.0 {
            return Err(AppError::Validation(format!(
                "Line item '{description}' has a negative amount."
            )));
        }
        normalized.push(json!({
            "description": description,
            "quantity": quantity,
            "unit_price": unit_price,
            "amount": round2(amount),
        }));
    }
    Ok(normalized)
}

/// `subtotal = Σ item.amount`, `total_amount = subtotal + tax_amount`.
pub fn compute_invoice_totals(line_items: &[Value], tax_amount: f64) -> AppResult<InvoiceTotals> {
    if tax_amount < 0.0 {
        return Err(AppError::Validation(
            "tax_amount cannot be negative.".to_string(),
        ));
    }
    let subtotal = round2(
        line_items
            .iter()
            .map(|item| number_or(item.get("amount"), 0.0))
            .sum(),
    );
    Ok(InvoiceTotals {
        subtotal,
        tax_amount: round2(tax_amount),
        total_amount: round2(subtotal + tax_amount),
    })
}

pub fn outstanding_amount(total_amount: f64, paid_amount: f64) -> f64 {
    round2((total_amount - paid_amount).max(0.0))
}

/// Apply one payment against an invoice. Raises when the stored ledger is
/// already inconsistent (`paid_amount != Σ payments[].amount`) instead of
/// coercing it; an overpayment keeps the true sum and flags the entry.
pub fn apply_payment_to_invoice(
    invoice: &Value,
    payment_id: &str,
    amount: f64,
    payment_date: NaiveDate,
) -> AppResult<InvoiceApplication> {
    let paid_amount = number_or(invoice.get("paid_amount"), 0.0);
    let total_amount = number_or(invoice.get("total_amount"), 0.0);
    let applied_sum = round2(
        invoice
            .get("payments")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| number_or(entry.get("amount"), 0.0))
                    .sum()
            })
            .unwrap_or(0.0),
    );
    if (round2(paid_amount) - applied_sum).abs() > 0.005 {
        return Err(AppError::Internal(format!(
            "Invoice ledger is inconsistent: paid_amount {} does not match applied payments sum {}.",
            round2(paid_amount),
            applied_sum
        )));
    }

    let new_paid = round2(paid_amount + amount);
    let overpaid = new_paid > total_amount + 0.005;
    let status = if new_paid + 0.005 >= total_amount {
        "paid".to_string()
    } else {
        invoice
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("sent")
            .to_string()
    };

    Ok(InvoiceApplication {
        paid_amount: new_paid,
        status,
        payments_entry: json!({
            "payment_id": payment_id,
            "amount": round2(amount),
            "date": payment_date.to_string(),
            "overpaid": overpaid,
        }),
        overpaid,
    })
}

/// Apply one payment against a lease: balances, last payment date, and the
/// next due date advanced one month per full rent covered.
pub fn apply_payment_to_lease(
    lease: &Value,
    amount: f64,
    payment_date: NaiveDate,
) -> AppResult<LeaseApplication> {
    if amount <= 0.0 {
        return Err(AppError::Validation(
            "Payment amount must be positive.".to_string(),
        ));
    }
    let total_paid = round2(number_or(lease.get("total_paid"), 0.0) + amount);
    let balance_due = round2((number_or(lease.get("balance_due"), 0.0) - amount).max(0.0));
    let monthly_rent = number_or(lease.get("monthly_rent"), 0.0);
    let months_advanced = months_covered(amount, monthly_rent);

    let next_payment_due = if months_advanced > 0 {
        let current_due = lease
            .get("next_payment_due")
            .and_then(Value::as_str)
            .and_then(|raw| NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok())
            .unwrap_or(payment_date);
        current_due.checked_add_months(Months::new(months_advanced))
    } else {
        None
    };

    Ok(LeaseApplication {
        total_paid,
        balance_due,
        last_payment_date: payment_date,
        next_payment_due,
        months_advanced,
    })
}

pub fn months_covered(amount: f64, monthly_rent: f64) -> u32 {
    if monthly_rent <= 0.0 {
        return 0;
    }
    (amount / monthly_rent).floor().max(0.0) as u32
}

/// Write-time late computation: a payment past its due date that is not
/// yet completed is late by the number of elapsed days.
pub fn late_payment_for(due_date: Option<NaiveDate>, today: NaiveDate) -> Value {
    match due_date {
        Some(due) if today > due => json!({
            "is_late": true,
            "days_late": (today - due).num_days(),
            "fee_applied": false,
        }),
        _ => json!({
            "is_late": false,
            "days_late": 0,
            "fee_applied": false,
        }),
    }
}

/// Apply the cross-entity effects of an approved payment inside the caller's
/// transaction: invoice `payments`/`paid_amount`/`status`, lease balances and
/// due dates. Rows are locked `FOR UPDATE` so two concurrent postings cannot
/// interleave, and everything commits or rolls back with the payment update.
pub async fn post_payment_effects(
    conn: &mut PgConnection,
    payment: &Value,
    timezone: Tz,
) -> AppResult<PaymentPosting> {
    let payment_id = value_str(payment, "id");
    let amount = number_or(payment.get("amount"), 0.0);
    if payment_id.is_empty() || amount <= 0.0 {
        return Err(AppError::Internal(
            "Payment record is missing an id or a positive amount.".to_string(),
        ));
    }
    let payment_date = value_str(payment, "payment_date")
        .parse::<NaiveDate>()
        .unwrap_or_else(|_| Utc::now().with_timezone(&timezone).date_naive());

    let mut posting = PaymentPosting::default();

    let invoice_id = value_str(payment, "invoice_id");
    if !invoice_id.is_empty() {
        let invoice = fetch_row_for_update(conn, "invoices", &invoice_id).await?;
        let application = apply_payment_to_invoice(&invoice, &payment_id, amount, payment_date)?;
        if application.overpaid {
            tracing::warn!(
                invoice_id = %invoice_id,
                payment_id = %payment_id,
                paid_amount = application.paid_amount,
                "Accepted overpayment pushed invoice past its total"
            );
        }

        let mut payments = invoice
            .get("payments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        payments.push(application.payments_entry.clone());

        let mut patch = Map::new();
        patch.insert("paid_amount".to_string(), json!(application.paid_amount));
        patch.insert("status".to_string(), Value::String(application.status));
        patch.insert("payments".to_string(), Value::Array(payments));
        patch.insert(
            "updated_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        posting.invoice = Some(update_row_tx(conn, "invoices", &invoice_id, &patch, "id").await?);
    }

    let lease_id = value_str(payment, "lease_id");
    if !lease_id.is_empty() {
        let lease = fetch_row_for_update(conn, "leases", &lease_id).await?;
        let application = apply_payment_to_lease(&lease, amount, payment_date)?;

        let mut patch = Map::new();
        patch.insert("total_paid".to_string(), json!(application.total_paid));
        patch.insert("balance_due".to_string(), json!(application.balance_due));
        patch.insert(
            "last_payment_date".to_string(),
            Value::String(application.last_payment_date.to_string()),
        );
        if let Some(next_due) = application.next_payment_due {
            patch.insert(
                "next_payment_due".to_string(),
                Value::String(next_due.to_string()),
            );
        }
        patch.insert(
            "updated_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        posting.lease = Some(update_row_tx(conn, "leases", &lease_id, &patch, "id").await?);
    }

    Ok(posting)
}

/// Counters for one overdue reclassification run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OverdueSweepResult {
    pub scanned: u32,
    pub transitioned: u32,
    pub notifications_emitted: u32,
    pub errors: u32,
}

/// Promote unpaid `sent` invoices past their due date to `overdue`. The
/// conditional update makes the sweep idempotent; running it twice (or
/// concurrently with an approval) never double-transitions a row.
pub async fn run_overdue_invoice_sweep(pool: &PgPool, timezone: Tz) -> OverdueSweepResult {
    let today = Utc::now().with_timezone(&timezone).date_naive();
    let mut result = OverdueSweepResult::default();

    let mut filters = Map::new();
    filters.insert("status".to_string(), Value::String("sent".to_string()));
    filters.insert(
        "due_date__lt".to_string(),
        Value::String(today.to_string()),
    );

    let invoices = match list_rows(pool, "invoices", Some(&filters), 500, 0, "due_date", true).await
    {
        Ok(rows) => rows,
        Err(error) => {
            tracing::warn!(error = %error, "Failed to list sent invoices for the overdue sweep");
            result.errors += 1;
            return result;
        }
    };

    for invoice in invoices {
        result.scanned += 1;
        let invoice_id = value_str(&invoice, "id");
        if invoice_id.is_empty() {
            continue;
        }

        let updated = sqlx::query(
            "UPDATE invoices
             SET status = 'overdue', updated_at = now()
             WHERE id = $1::uuid
               AND status = 'sent'
             RETURNING 1",
        )
        .bind(&invoice_id)
        .fetch_optional(pool)
        .await;

        match updated {
            Ok(Some(_)) => {
                result.transitioned += 1;
                let tenant_id = value_str(&invoice, "tenant_id");
                if tenant_id.is_empty() {
                    continue;
                }
                let invoice_number = value_str(&invoice, "invoice_number");
                let emitted = emit_event(
                    pool,
                    EmitNotificationEventInput {
                        event_type: "invoice_overdue".to_string(),
                        title: "Invoice overdue".to_string(),
                        body: format!("Invoice {invoice_number} is past its due date."),
                        related: Some((RelatedKind::Invoice, invoice_id.clone())),
                        actor_user_id: None,
                        payload: Map::new(),
                        dedupe_key: Some(format!("invoice_overdue:{invoice_id}")),
                        recipients: vec![NotificationRecipient {
                            user_id: tenant_id,
                            action_required: true,
                            priority: "high".to_string(),
                        }],
                    },
                )
                .await;
                if emitted.is_ok() {
                    result.notifications_emitted += 1;
                }
            }
            Ok(None) => {
                // Another writer got there first; nothing to do.
            }
            Err(error) => {
                tracing::warn!(error = %error, invoice_id = %invoice_id, "Overdue transition failed");
                result.errors += 1;
            }
        }
    }

    tracing::info!(
        scanned = result.scanned,
        transitioned = result.transitioned,
        notifications = result.notifications_emitted,
        errors = result.errors,
        "Overdue invoice sweep completed"
    );
    result
}

async fn fetch_row_for_update(
    conn: &mut PgConnection,
    table: &'static str,
    row_id: &str,
) -> AppResult<Value> {
    let sql = format!("SELECT row_to_json(t) AS row FROM {table} t WHERE id = $1::uuid FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(row_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|error| {
            tracing::error!(error = %error, table, "Row lock failed");
            AppError::Dependency("Database operation failed.".to_string())
        })?;

    row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table} record not found.")))
}

fn number_or(value: Option<&Value>, default: f64) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(default),
        Some(Value::String(text)) => text.trim().parse::<f64>().unwrap_or(default),
        _ => default,
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
    use chrono::NaiveDate;
    use serde_json::json;

    use super::{
        apply_payment_to_invoice, apply_payment_to_lease, compute_invoice_totals,
        late_payment_for, months_covered, normalize_line_items, outstanding_amount, round2,
    };
    use crate::error::AppError;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn totals_derive_from_line_items_only() {
        let items = normalize_line_items(&[
            json!({"description": "Rent March", "quantity": 1, "unit_price": 1000.0}),
            json!({"description": "Parking", "quantity": 2, "unit_price": 50.0}),
        ])
        .unwrap();
        assert_eq!(items[0]["amount"], json!(1000.0));
        assert_eq!(items[1]["amount"], json!(100.0));

        let totals = compute_invoice_totals(&items, 110.0).unwrap();
        assert_eq!(totals.subtotal, 1100.0);
        assert_eq!(totals.total_amount, 1210.0);
        assert_eq!(outstanding_amount(totals.total_amount, 200.0), 1010.0);
        assert_eq!(outstanding_amount(100.0, 250.0), 0.0);
    }

    #[test]
    fn rejects_bad_line_items() {
        assert!(normalize_line_items(&[]).is_err());
        assert!(normalize_line_items(&[json!({"description": "  ", "unit_price": 1.0})]).is_err());
        assert!(
            normalize_line_items(&[json!({"description": "x", "quantity": 0, "unit_price": 1.0})])
                .is_err()
        );
        assert!(compute_invoice_totals(&[], -1.0).is_err());
    }

    #[test]
    fn full_payment_marks_the_invoice_paid() {
        let invoice = json!({
            "paid_amount": 0.0,
            "total_amount": 1200.0,
            "status": "sent",
            "payments": [],
        });
        let applied =
            apply_payment_to_invoice(&invoice, "pay-1", 1200.0, date(2026, 3, 1)).unwrap();
        assert_eq!(applied.paid_amount, 1200.0);
        assert_eq!(applied.status, "paid");
        assert!(!applied.overpaid);
        assert_eq!(applied.payments_entry["payment_id"], "pay-1");
        assert_eq!(applied.payments_entry["date"], "2026-03-01");
    }

    #[test]
    fn partial_payment_leaves_status_unchanged() {
        let invoice = json!({
            "paid_amount": 300.0,
            "total_amount": 1200.0,
            "status": "sent",
            "payments": [{"payment_id": "pay-0", "amount": 300.0, "date": "2026-02-01"}],
        });
        let applied = apply_payment_to_invoice(&invoice, "pay-1", 400.0, date(2026, 3, 1)).unwrap();
        assert_eq!(applied.paid_amount, 700.0);
        assert_eq!(applied.status, "sent");
    }

    #[test]
    fn overpayment_is_flagged_not_clamped() {
        let invoice = json!({
            "paid_amount": 1000.0,
            "total_amount": 1200.0,
            "status": "sent",
            "payments": [{"payment_id": "pay-0", "amount": 1000.0, "date": "2026-02-01"}],
        });
        let applied = apply_payment_to_invoice(&invoice, "pay-1", 500.0, date(2026, 3, 1)).unwrap();
        assert_eq!(applied.paid_amount, 1500.0);
        assert_eq!(applied.status, "paid");
        assert!(applied.overpaid);
        assert_eq!(applied.payments_entry["overpaid"], json!(true));
    }

    #[test]
    fn inconsistent_stored_ledger_raises_instead_of_coercing() {
        let invoice = json!({
            "paid_amount": 900.0,
            "total_amount": 1200.0,
            "status": "sent",
            "payments": [{"payment_id": "pay-0", "amount": 300.0, "date": "2026-02-01"}],
        });
        let error =
            apply_payment_to_invoice(&invoice, "pay-1", 100.0, date(2026, 3, 1)).unwrap_err();
        assert!(matches!(error, AppError::Internal(_)));
    }

    #[test]
    fn lease_balances_move_and_due_date_advances_per_full_rent() {
        let lease = json!({
            "total_paid": 2400.0,
            "balance_due": 1200.0,
            "monthly_rent": 1200.0,
            "next_payment_due": "2026-04-01",
        });
        let applied = apply_payment_to_lease(&lease, 1200.0, date(2026, 3, 28)).unwrap();
        assert_eq!(applied.total_paid, 3600.0);
        assert_eq!(applied.balance_due, 0.0);
        assert_eq!(applied.months_advanced, 1);
        assert_eq!(applied.next_payment_due, Some(date(2026, 5, 1)));
        assert_eq!(applied.last_payment_date, date(2026, 3, 28));
    }

    #[test]
    fn partial_rent_never_advances_the_due_date() {
        let lease = json!({
            "total_paid": 0.0,
            "balance_due": 1200.0,
            "monthly_rent": 1200.0,
            "next_payment_due": "2026-04-01",
        });
        let applied = apply_payment_to_lease(&lease, 600.0, date(2026, 3, 28)).unwrap();
        assert_eq!(applied.balance_due, 600.0);
        assert_eq!(applied.months_advanced, 0);
        assert_eq!(applied.next_payment_due, None);
    }

    #[test]
    fn multi_month_payment_advances_multiple_months() {
        let lease = json!({
            "total_paid": 0.0,
            "balance_due": 3600.0,
            "monthly_rent": 1200.0,
            "next_payment_due": "2026-04-01",
        });
        let applied = apply_payment_to_lease(&lease, 3700.0, date(2026, 3, 1)).unwrap();
        assert_eq!(applied.months_advanced, 3);
        assert_eq!(applied.next_payment_due, Some(date(2026, 7, 1)));
        assert_eq!(applied.balance_due, 0.0);

        assert_eq!(months_covered(3700.0, 1200.0), 3);
        assert_eq!(months_covered(1199.99, 1200.0), 0);
        assert_eq!(months_covered(1200.0, 0.0), 0);
    }

    #[test]
    fn late_payment_is_computed_at_write_time() {
        let on_time = late_payment_for(Some(date(2026, 3, 10)), date(2026, 3, 10));
        assert_eq!(on_time["is_late"], json!(false));
        assert_eq!(on_time["days_late"], json!(0));

        let late = late_payment_for(Some(date(2026, 3, 10)), date(2026, 3, 14));
        assert_eq!(late["is_late"], json!(true));
        assert_eq!(late["days_late"], json!(4));
        assert_eq!(late["fee_applied"], json!(false));

        let no_due = late_payment_for(None, date(2026, 3, 14));
        assert_eq!(no_due["is_late"], json!(false));
    }

    #[test]
    fn rounding_is_cent_precise() {
        assert_eq!(round2(10.005), 10.01);
        assert_eq!(round2(0.1 + 0.2), 0.3);
    }
}
