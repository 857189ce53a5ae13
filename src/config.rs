use std::env;

use chrono_tz::Tz;

const DEFAULT_OPERATING_TIMEZONE: &str = "America/Bogota";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub docs_enabled: bool,
    pub dev_auth_overrides_enabled: bool,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub auth_jwt_secret: Option<String>,
    pub auth_jwt_audience: Option<String>,
    pub auth_introspection_url: Option<String>,
    pub auth_cache_ttl_seconds: u64,
    pub auth_cache_max_entries: u64,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub default_user_id: Option<String>,
    pub scheduler_token: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub notify_webhook_secret: Option<String>,
    pub notify_webhook_timeout_seconds: u64,
    pub app_public_url: String,
    pub operating_timezone: Tz,
    pub request_expiry_days: i64,
    pub request_approval_grace_days: i64,
    pub request_priority_high_after_days: i64,
    pub request_urgent_after_days: i64,
    pub identifier_max_attempts: u32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Rentora API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            trusted_hosts: parse_csv(&env_or("TRUSTED_HOSTS", "localhost,127.0.0.1")),
            docs_enabled: env_parse_bool_or("DOCS_ENABLED", true),
            dev_auth_overrides_enabled: env_parse_bool_or("DEV_AUTH_OVERRIDES_ENABLED", false),
            rate_limit_enabled: env_parse_bool_or("RATE_LIMIT_ENABLED", true),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            auth_jwt_secret: env_opt("AUTH_JWT_SECRET"),
            auth_jwt_audience: env_opt("AUTH_JWT_AUDIENCE"),
            auth_introspection_url: valid_url_opt("AUTH_INTROSPECTION_URL"),
            auth_cache_ttl_seconds: env_parse_or("AUTH_CACHE_TTL_SECONDS", 30),
            auth_cache_max_entries: env_parse_or("AUTH_CACHE_MAX_ENTRIES", 10000),
            database_url: env_opt("DATABASE_URL"),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            default_user_id: env_opt("DEFAULT_USER_ID"),
            scheduler_token: env_opt("SCHEDULER_TOKEN"),
            notify_webhook_url: valid_url_opt("NOTIFY_WEBHOOK_URL"),
            notify_webhook_secret: env_opt("NOTIFY_WEBHOOK_SECRET"),
            notify_webhook_timeout_seconds: env_parse_or("NOTIFY_WEBHOOK_TIMEOUT_SECONDS", 10),
            app_public_url: env_or("APP_PUBLIC_URL", "http://localhost:3000"),
            operating_timezone: parse_timezone(env_opt("OPERATING_TIMEZONE")),
            request_expiry_days: env_parse_or("REQUEST_EXPIRY_DAYS", 30),
            request_approval_grace_days: env_parse_or("REQUEST_APPROVAL_GRACE_DAYS", 14),
            request_priority_high_after_days: env_parse_or("REQUEST_PRIORITY_HIGH_AFTER_DAYS", 7),
            request_urgent_after_days: env_parse_or("REQUEST_URGENT_AFTER_DAYS", 14),
            identifier_max_attempts: env_parse_or("IDENTIFIER_MAX_ATTEMPTS", 10),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn docs_enabled_runtime(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.docs_enabled
    }

    pub fn auth_dev_overrides_enabled(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.dev_auth_overrides_enabled
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn valid_url_opt(key: &str) -> Option<String> {
    let raw = env_opt(key)?;
    match url::Url::parse(&raw) {
        Ok(_) => Some(raw),
        Err(error) => {
            tracing::warn!(key, error = %error, "Ignoring malformed URL in environment");
            None
        }
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_timezone(raw: Option<String>) -> Tz {
    let candidate = raw.unwrap_or_else(|| DEFAULT_OPERATING_TIMEZONE.to_string());
    match candidate.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(
                timezone = %candidate,
                "Unknown OPERATING_TIMEZONE, falling back to default"
            );
            DEFAULT_OPERATING_TIMEZONE
                .parse::<Tz>()
                .unwrap_or(chrono_tz::UTC)
        }
    }
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::{normalize_prefix, parse_csv, parse_timezone};

    #[test]
    fn normalizes_prefix() {
        assert_eq!(normalize_prefix("v1"), "/v1");
        assert_eq!(normalize_prefix("/v1/"), "/v1");
        assert_eq!(normalize_prefix(""), "/v1");
    }

    #[test]
    fn splits_and_trims_csv() {
        assert_eq!(
            parse_csv(" a , b ,, c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_csv(" ,, ").is_empty());
    }

    #[test]
    fn falls_back_on_unknown_timezone() {
        assert_eq!(
            parse_timezone(Some("Mars/Olympus".to_string())),
            chrono_tz::America::Bogota
        );
        assert_eq!(
            parse_timezone(Some("America/Mexico_City".to_string())),
            chrono_tz::America::Mexico_City
        );
        assert_eq!(parse_timezone(None), chrono_tz::America::Bogota);
    }
}
