use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::repository::table_service::{create_row, list_rows};

type HmacSha256 = Hmac<Sha256>;

/// What a notification event points back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelatedKind {
    Payment,
    Invoice,
    PropertyRequest,
    Lease,
}

impl RelatedKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Invoice => "invoice",
            Self::PropertyRequest => "property_request",
            Self::Lease => "lease",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRecipient {
    pub user_id: String,
    pub action_required: bool,
    pub priority: String,
}

#[derive(Debug, Clone)]
pub struct EmitNotificationEventInput {
    pub event_type: String,
    pub title: String,
    pub body: String,
    pub related: Option<(RelatedKind, String)>,
    pub actor_user_id: Option<String>,
    pub payload: Map<String, Value>,
    pub dedupe_key: Option<String>,
    pub recipients: Vec<NotificationRecipient>,
}

#[derive(Debug, Clone)]
pub struct NotificationListResult {
    pub data: Vec<Value>,
    pub next_cursor: Option<String>,
}

/// Write one notification event and fan it out to per-user rows.
///
/// Events with a dedupe key get a deterministic id, so a retried emit lands
/// on the same event row; fan-out inserts use `ON CONFLICT DO NOTHING`, so a
/// recipient never sees the same event twice. Returns the event row, or
/// `None` when the input is too empty to be worth recording.
pub async fn emit_event(
    pool: &PgPool,
    input: EmitNotificationEventInput,
) -> AppResult<Option<Value>> {
    let event_type = input.event_type.trim();
    let title = input.title.trim();
    if event_type.is_empty() || title.is_empty() {
        return Ok(None);
    }

    let dedupe_key = input
        .dedupe_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);

    let event_row = if let Some(key) = dedupe_key.as_deref() {
        if let Some(existing) = find_event_by_dedupe_key(pool, key).await? {
            existing
        } else {
            insert_event_row(pool, event_type, title, dedupe_key.as_deref(), &input).await?
        }
    } else {
        insert_event_row(pool, event_type, title, None, &input).await?
    };

    let event_id = value_str(&event_row, "id");
    if event_id.is_empty() {
        return Ok(Some(event_row));
    }

    for recipient in &input.recipients {
        let user_id = recipient.user_id.trim();
        if user_id.is_empty() {
            continue;
        }
        sqlx::query(
            "INSERT INTO user_notifications
                 (event_id, recipient_user_id, action_required, priority)
             VALUES ($1::uuid, $2::uuid, $3, $4)
             ON CONFLICT (event_id, recipient_user_id) DO NOTHING",
        )
        .bind(&event_id)
        .bind(user_id)
        .bind(recipient.action_required)
        .bind(normalize_priority(&recipient.priority))
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;
    }

    Ok(Some(event_row))
}

/// Deterministic event id. Events carrying a dedupe key hash it into a v5
/// uuid so concurrent emitters race onto the same primary key instead of
/// creating twins; everything else gets a fresh v4.
pub fn event_id_for(dedupe_key: Option<&str>) -> Uuid {
    match dedupe_key {
        Some(key) => Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
        None => Uuid::new_v4(),
    }
}

fn normalize_priority(raw: &str) -> &str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "high" => "high",
        "urgent" => "urgent",
        "low" => "low",
        _ => "normal",
    }
}

/// The approver audience for a property-scoped event: the owning landlord
/// plus every manager holding the named permission. Used when a payment or
/// invoice enters the review queue.
pub async fn resolve_approver_recipients(
    pool: &PgPool,
    property: &Value,
    required_permission: &str,
) -> AppResult<Vec<NotificationRecipient>> {
    let mut recipients = Vec::new();
    let mut seen = std::collections::BTreeSet::new();

    let landlord_id = value_str(property, "landlord_id");
    if !landlord_id.is_empty() && seen.insert(landlord_id.clone()) {
        recipients.push(NotificationRecipient {
            user_id: landlord_id,
            action_required: true,
            priority: "normal".to_string(),
        });
    }

    let mut filters = Map::new();
    filters.insert(
        "role".to_string(),
        Value::String(crate::authz::ROLE_MANAGER.to_string()),
    );
    filters.insert("is_active".to_string(), Value::Bool(true));

    let managers = list_rows(pool, "users", Some(&filters), 500, 0, "created_at", true).await?;
    for manager in managers {
        if !crate::authz::actor_has_permission(&manager, required_permission) {
            continue;
        }
        let user_id = value_str(&manager, "id");
        if !user_id.is_empty() && seen.insert(user_id.clone()) {
            recipients.push(NotificationRecipient {
                user_id,
                action_required: true,
                priority: "normal".to_string(),
            });
        }
    }

    Ok(recipients)
}

pub async fn list_for_user(
    pool: &PgPool,
    user_id: &str,
    unread_only: bool,
    event_type: Option<&str>,
    cursor: Option<&str>,
    limit: i64,
) -> AppResult<NotificationListResult> {
    let type_filter = event_type
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned);
    let cursor_iso = cursor
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc).to_rfc3339());

    let rows = sqlx::query(
        "SELECT
            un.id::text AS notification_id,
            un.action_required,
            un.priority,
            un.read_at,
            un.created_at AS delivered_at,
            ne.id::text AS event_id,
            ne.event_type,
            ne.title,
            ne.body,
            ne.related_type,
            ne.related_id,
            ne.payload,
            ne.created_at AS event_created_at
         FROM user_notifications un
         JOIN notification_events ne ON ne.id = un.event_id
         WHERE un.recipient_user_id = $1::uuid
           AND ($2::timestamptz IS NULL OR un.created_at < $2::timestamptz)
           AND (NOT $3::bool OR un.read_at IS NULL)
           AND ($4::text IS NULL OR ne.event_type = $4::text)
         ORDER BY un.created_at DESC
         LIMIT $5",
    )
    .bind(user_id)
    .bind(cursor_iso)
    .bind(unread_only)
    .bind(type_filter)
    .bind(limit.clamp(1, 100))
    .fetch_all(pool)
    .await
    .map_err(map_sqlx_error)?;

    let mut data = Vec::with_capacity(rows.len());
    for row in &rows {
        let payload = row
            .try_get::<Option<Value>, _>("payload")
            .ok()
            .flatten()
            .unwrap_or_else(|| Value::Object(Map::new()));
        data.push(json!({
            "id": row.try_get::<String, _>("notification_id").unwrap_or_default(),
            "event_id": row.try_get::<String, _>("event_id").unwrap_or_default(),
            "event_type": row.try_get::<String, _>("event_type").unwrap_or_default(),
            "title": row.try_get::<String, _>("title").unwrap_or_default(),
            "body": row.try_get::<String, _>("body").unwrap_or_default(),
            "related_type": row.try_get::<Option<String>, _>("related_type").ok().flatten(),
            "related_id": row.try_get::<Option<String>, _>("related_id").ok().flatten(),
            "payload": payload,
            "action_required": row.try_get::<bool, _>("action_required").unwrap_or(false),
            "priority": row
                .try_get::<Option<String>, _>("priority")
                .ok()
                .flatten()
                .unwrap_or_else(|| "normal".to_string()),
            "read_at": row
                .try_get::<Option<DateTime<Utc>>, _>("read_at")
                .ok()
                .flatten()
                .map(|value| value.to_rfc3339()),
            "created_at": row
                .try_get::<Option<DateTime<Utc>>, _>("delivered_at")
                .ok()
                .flatten()
                .map(|value| value.to_rfc3339()),
            "event_created_at": row
                .try_get::<Option<DateTime<Utc>>, _>("event_created_at")
                .ok()
                .flatten()
                .map(|value| value.to_rfc3339()),
        }));
    }

    let next_cursor = rows
        .last()
        .and_then(|row| {
            row.try_get::<Option<DateTime<Utc>>, _>("delivered_at")
                .ok()
                .flatten()
        })
        .map(|value| value.to_rfc3339());

    Ok(NotificationListResult { data, next_cursor })
}

pub async fn unread_count(pool: &PgPool, user_id: &str) -> AppResult<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*)::bigint AS total
         FROM user_notifications
         WHERE recipient_user_id = $1::uuid
           AND read_at IS NULL",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

/// Mark one notification read. COALESCE keeps the first read timestamp when
/// two devices race; marking an already-read row is a no-op, not an error.
pub async fn mark_read(
    pool: &PgPool,
    user_id: &str,
    notification_id: &str,
) -> AppResult<Option<Value>> {
    let row = sqlx::query(
        "UPDATE user_notifications
         SET read_at = COALESCE(read_at, now())
         WHERE id = $1::uuid
           AND recipient_user_id = $2::uuid
         RETURNING id::text AS id, read_at",
    )
    .bind(notification_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(row.map(|item| {
        json!({
            "id": item.try_get::<String, _>("id").unwrap_or_default(),
            "read_at": item
                .try_get::<Option<DateTime<Utc>>, _>("read_at")
                .ok()
                .flatten()
                .map(|value| value.to_rfc3339())
        })
    }))
}

pub async fn mark_all_read(pool: &PgPool, user_id: &str) -> AppResult<i64> {
    let rows = sqlx::query(
        "UPDATE user_notifications
         SET read_at = now()
         WHERE recipient_user_id = $1::uuid
           AND read_at IS NULL
         RETURNING 1",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(rows.len() as i64)
}

/// Push one event to the configured delivery channels, after the triggering
/// transaction has committed. Failures are recorded on the event and logged;
/// they never bubble into the request that emitted the event.
pub async fn deliver_event(
    pool: &PgPool,
    http_client: &reqwest::Client,
    config: &AppConfig,
    event: &Value,
) {
    let event_id = value_str(event, "id");
    if event_id.is_empty() {
        return;
    }

    let webhook_outcome = match (
        config.notify_webhook_url.as_deref(),
        config.notify_webhook_secret.as_deref(),
    ) {
        (Some(url), Some(secret)) => {
            deliver_webhook(http_client, config, url, secret, event).await
        }
        _ => ChannelOutcome::skipped("webhook not configured"),
    };

    // Email and SMS providers are not wired up; the ledger still records the
    // decision so operators can see what a given event reached.
    let outcomes = vec![
        webhook_outcome.into_entry("webhook"),
        ChannelOutcome::skipped("email provider not configured").into_entry("email"),
        ChannelOutcome::skipped("sms provider not configured").into_entry("sms"),
    ];

    let appended = sqlx::query(
        "UPDATE notification_events
         SET sent_via = COALESCE(sent_via, '[]'::jsonb) || $1::jsonb
         WHERE id = $2::uuid",
    )
    .bind(Value::Array(outcomes))
    .bind(&event_id)
    .execute(pool)
    .await;

    if let Err(error) = appended {
        tracing::warn!(error = %error, event_id = %event_id, "Failed to record delivery outcomes");
    }
}

struct ChannelOutcome {
    status: &'static str,
    detail: Option<String>,
}

impl ChannelOutcome {
    fn sent() -> Self {
        Self {
            status: "sent",
            detail: None,
        }
    }

    fn skipped(reason: &str) -> Self {
        Self {
            status: "skipped",
            detail: Some(reason.to_string()),
        }
    }

    fn failed(reason: String) -> Self {
        Self {
            status: "failed",
            detail: Some(reason),
        }
    }

    fn into_entry(self, channel: &str) -> Value {
        json!({
            "channel": channel,
            "status": self.status,
            "detail": self.detail,
            "at": Utc::now().to_rfc3339(),
        })
    }
}

async fn deliver_webhook(
    http_client: &reqwest::Client,
    config: &AppConfig,
    url: &str,
    secret: &str,
    event: &Value,
) -> ChannelOutcome {
    let body = event.to_string();
    let timestamp = Utc::now().timestamp();
    let signature = sign_webhook_payload(secret, timestamp, &body);

    let response = http_client
        .post(url)
        .header("content-type", "application/json")
        .header("x-rentora-signature", signature)
        .timeout(std::time::Duration::from_secs(
            config.notify_webhook_timeout_seconds.max(1),
        ))
        .body(body)
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => ChannelOutcome::sent(),
        Ok(response) => {
            tracing::warn!(status = %response.status(), "Notification webhook returned non-success");
            ChannelOutcome::failed(format!("upstream returned {}", response.status()))
        }
        Err(error) => {
            tracing::warn!(error = %error, "Notification webhook delivery failed");
            ChannelOutcome::failed("request failed".to_string())
        }
    }
}

/// `t=<unix ts>,v1=<hex hmac-sha256 of "<ts>.<body>">`, so receivers can
/// verify both integrity and freshness with one header.
pub fn sign_webhook_payload(secret: &str, timestamp: i64, body: &str) -> String {
    let signed_payload = format!("{timestamp}.{body}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| HmacSha256::new_from_slice(b"-").unwrap());
    mac.update(signed_payload.as_bytes());
    let digest = mac.finalize().into_bytes();
    format!("t={timestamp},v1={}", hex_encode(&digest))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

async fn insert_event_row(
    pool: &PgPool,
    event_type: &str,
    title: &str,
    dedupe_key: Option<&str>,
    input: &EmitNotificationEventInput,
) -> AppResult<Value> {
    let mut record = Map::new();
    record.insert(
        "id".to_string(),
        Value::String(event_id_for(dedupe_key).to_string()),
    );
    record.insert(
        "event_type".to_string(),
        Value::String(event_type.to_string()),
    );
    record.insert("title".to_string(), Value::String(title.to_string()));
    record.insert(
        "body".to_string(),
        Value::String(input.body.trim().to_string()),
    );
    if let Some((kind, related_id)) = &input.related {
        record.insert(
            "related_type".to_string(),
            Value::String(kind.as_str().to_string()),
        );
        record.insert(
            "related_id".to_string(),
            Value::String(related_id.trim().to_string()),
        );
    }
    if let Some(actor_user_id) = input
        .actor_user_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        record.insert(
            "actor_user_id".to_string(),
            Value::String(actor_user_id.to_string()),
        );
    }
    if let Some(key) = dedupe_key {
        record.insert("dedupe_key".to_string(), Value::String(key.to_string()));
    }
    record.insert("payload".to_string(), Value::Object(input.payload.clone()));
    record.insert("sent_via".to_string(), Value::Array(Vec::new()));

    match create_row(pool, "notification_events", &record).await {
        Ok(created) => Ok(created),
        Err(AppError::Conflict(_)) => {
            // Lost the race on the dedupe key; the winner's row is ours too.
            if let Some(key) = dedupe_key {
                if let Some(existing) = find_event_by_dedupe_key(pool, key).await? {
                    return Ok(existing);
                }
            }
            Err(AppError::Conflict(
                "Duplicate notification event rejected by dedupe key.".to_string(),
            ))
        }
        Err(error) => Err(error),
    }
}

async fn find_event_by_dedupe_key(pool: &PgPool, dedupe_key: &str) -> AppResult<Option<Value>> {
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM notification_events t
         WHERE dedupe_key = $1
         LIMIT 1",
    )
    .bind(dedupe_key)
    .fetch_optional(pool)
    .await
    .map_err(map_sqlx_error)?;

    Ok(row.and_then(|item| item.try_get::<Option<Value>, _>("row").ok().flatten()))
}

fn map_sqlx_error(error: sqlx::Error) -> AppError {
    tracing::error!(db_error = %error, "Database query failed");
    AppError::Dependency("Database operation failed.".to_string())
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
    use super::{event_id_for, normalize_priority, sign_webhook_payload, RelatedKind};

    #[test]
    fn dedupe_keys_map_to_stable_event_ids() {
        let first = event_id_for(Some("invoice_overdue:abc"));
        let second = event_id_for(Some("invoice_overdue:abc"));
        let other = event_id_for(Some("invoice_overdue:def"));
        assert_eq!(first, second);
        assert_ne!(first, other);

        let random_a = event_id_for(None);
        let random_b = event_id_for(None);
        assert_ne!(random_a, random_b);
    }

    #[test]
    fn priorities_collapse_to_the_known_vocabulary() {
        assert_eq!(normalize_priority(" HIGH "), "high");
        assert_eq!(normalize_priority("urgent"), "urgent");
        assert_eq!(normalize_priority("low"), "low");
        assert_eq!(normalize_priority("critical"), "normal");
        assert_eq!(normalize_priority(""), "normal");
    }

    #[test]
    fn webhook_signature_is_deterministic_and_versioned() {
        let signature = sign_webhook_payload("secret", 1_700_000_000, "{\"a\":1}");
        assert!(signature.starts_with("t=1700000000,v1="));
        let hex = signature.rsplit("v1=").next().unwrap();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));

        // Same inputs, same signature; any input change breaks it.
        assert_eq!(
            signature,
            sign_webhook_payload("secret", 1_700_000_000, "{\"a\":1}")
        );
        assert_ne!(
            signature,
            sign_webhook_payload("secret", 1_700_000_001, "{\"a\":1}")
        );
        assert_ne!(
            signature,
            sign_webhook_payload("other", 1_700_000_000, "{\"a\":1}")
        );
    }

    #[test]
    fn related_kinds_serialize_to_snake_case() {
        assert_eq!(RelatedKind::Payment.as_str(), "payment");
        assert_eq!(RelatedKind::PropertyRequest.as_str(), "property_request");
        assert_eq!(RelatedKind::Lease.as_str(), "lease");
    }
}
