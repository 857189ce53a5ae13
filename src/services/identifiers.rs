use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use sqlx::{PgPool, Row};

use crate::error::{AppError, AppResult};

const RECEIPT_SERIAL_DIGITS: u32 = 5;
const INVOICE_SERIAL_DIGITS: u32 = 4;

/// Uniqueness pre-check for generated identifiers. The store's unique index
/// remains the real guarantee; this only avoids wasted insert conflicts.
pub trait IdentifierStore {
    async fn exists(&self, candidate: &str) -> AppResult<bool>;
}

/// Checks receipt numbers against `payments.receipt_number`.
pub struct ReceiptNumberStore<'a>(pub &'a PgPool);

/// Checks invoice numbers against `invoices.invoice_number`.
pub struct InvoiceNumberStore<'a>(pub &'a PgPool);

impl IdentifierStore for ReceiptNumberStore<'_> {
    async fn exists(&self, candidate: &str) -> AppResult<bool> {
        column_value_exists(self.0, "payments", "receipt_number", candidate).await
    }
}

impl IdentifierStore for InvoiceNumberStore<'_> {
    async fn exists(&self, candidate: &str) -> AppResult<bool> {
        column_value_exists(self.0, "invoices", "invoice_number", candidate).await
    }
}

/// Generate a payment receipt number `PAY-YYYYMMDD-NNNNN`, retrying on
/// collision up to `max_attempts` before giving up.
pub async fn generate_receipt_number<S: IdentifierStore>(
    store: &S,
    timezone: Tz,
    max_attempts: u32,
) -> AppResult<String> {
    let today = Utc::now().with_timezone(&timezone).date_naive();
    generate_unique(store, max_attempts, || {
        format_receipt_number(today, random_serial(RECEIPT_SERIAL_DIGITS))
    })
    .await
}

/// Generate an invoice number `INV-YYYYMM-NNNN`, retrying on collision up to
/// `max_attempts` before giving up.
pub async fn generate_invoice_number<S: IdentifierStore>(
    store: &S,
    timezone: Tz,
    max_attempts: u32,
) -> AppResult<String> {
    let today = Utc::now().with_timezone(&timezone).date_naive();
    generate_unique(store, max_attempts, || {
        format_invoice_number(today, random_serial(INVOICE_SERIAL_DIGITS))
    })
    .await
}

pub fn format_receipt_number(date: NaiveDate, serial: u32) -> String {
    format!("PAY-{}-{:05}", date.format("%Y%m%d"), serial)
}

pub fn format_invoice_number(date: NaiveDate, serial: u32) -> String {
    format!("INV-{}-{:04}", date.format("%Y%m"), serial)
}

async fn generate_unique<S, F>(store: &S, max_attempts: u32, mut candidate: F) -> AppResult<String>
where
    S: IdentifierStore,
    F: FnMut() -> String,
{
    let attempts = max_attempts.max(1);
    for _ in 0..attempts {
        let value = candidate();
        if !store.exists(&value).await? {
            return Ok(value);
        }
    }
    Err(AppError::ExhaustedRetries(format!(
        "Could not generate a unique identifier after {attempts} attempts."
    )))
}

/// Zero-padded random serial. uuid v4 is the process entropy source already
/// in use for row ids; taking the low bits keeps the digits uniform enough
/// for a collision-retried namespace.
fn random_serial(digits: u32) -> u32 {
    let modulus = 10u128.pow(digits);
    (uuid::Uuid::new_v4().as_u128() % modulus) as u32
}

async fn column_value_exists(
    pool: &PgPool,
    table: &'static str,
    column: &'static str,
    candidate: &str,
) -> AppResult<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {column} = $1) AS hit");
    let row = sqlx::query(&sql)
        .bind(candidate)
        .fetch_one(pool)
        .await
        .map_err(|error| {
            tracing::error!(error = %error, table, column, "Identifier uniqueness check failed");
            AppError::Dependency("Database operation failed.".to_string())
        })?;
    Ok(row.try_get::<bool, _>("hit").unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;

    use chrono::NaiveDate;

    use super::{
        format_invoice_number, format_receipt_number, generate_receipt_number, random_serial,
        IdentifierStore,
    };
    use crate::error::{AppError, AppResult};

    struct MemoryStore {
        taken: RefCell<HashSet<String>>,
    }

    impl MemoryStore {
        fn new(taken: &[&str]) -> Self {
            Self {
                taken: RefCell::new(taken.iter().map(|value| value.to_string()).collect()),
            }
        }
    }

    impl IdentifierStore for MemoryStore {
        async fn exists(&self, candidate: &str) -> AppResult<bool> {
            Ok(self.taken.borrow().contains(candidate))
        }
    }

    struct SaturatedStore;

    impl IdentifierStore for SaturatedStore {
        async fn exists(&self, _candidate: &str) -> AppResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn formats_are_bit_exact() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert_eq!(format_receipt_number(date, 42), "PAY-20260307-00042");
        assert_eq!(format_invoice_number(date, 7), "INV-202603-0007");
        assert_eq!(format_receipt_number(date, 99999), "PAY-20260307-99999");
    }

    #[test]
    fn serial_stays_in_range() {
        for _ in 0..1000 {
            assert!(random_serial(4) < 10_000);
            assert!(random_serial(5) < 100_000);
        }
    }

    #[tokio::test]
    async fn generates_distinct_values_in_the_same_month() {
        let store = MemoryStore::new(&[]);
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let number =
                super::generate_invoice_number(&store, chrono_tz::UTC, 10).await.unwrap();
            assert!(
                regex_lite_match(&number),
                "unexpected invoice number shape: {number}"
            );
            store.taken.borrow_mut().insert(number.clone());
            assert!(seen.insert(number));
        }
    }

    #[tokio::test]
    async fn retries_past_collisions() {
        // Every candidate for today collides until the store stops reporting
        // hits; a fresh store with a few taken values must still succeed.
        let store = MemoryStore::new(&["PAY-19990101-00001"]);
        let number = generate_receipt_number(&store, chrono_tz::UTC, 10).await.unwrap();
        assert!(number.starts_with("PAY-"));
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let error = generate_receipt_number(&SaturatedStore, chrono_tz::UTC, 10)
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::ExhaustedRetries(_)));
    }

    fn regex_lite_match(number: &str) -> bool {
        // INV-YYYYMM-NNNN
        let parts: Vec<&str> = number.split('-').collect();
        parts.len() == 3
            && parts[0] == "INV"
            && parts[1].len() == 6
            && parts[1].chars().all(|c| c.is_ascii_digit())
            && parts[2].len() == 4
            && parts[2].chars().all(|c| c.is_ascii_digit())
    }
}
