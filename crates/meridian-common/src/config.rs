//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call meridian_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.api_port", 8080)?
        .set_default("server.signaling_port", 8081)?
        .set_default("server.admin_port", 8082)?
        .set_default("server.domain", "localhost")?
        .set_default("server.dev_origins", vec!["http://localhost:3000".to_string()])?
        .set_default(
            "server.android_apk_key_hash_origins",
            Vec::<String>::new(),
        )?
        .set_default("storage.db_path", "./data/relay.db")?
        .set_default("storage.busy_timeout_ms", 5_000_i64)?
        .set_default("storage.cache_kib", 8_000_i64)?
        .set_default("storage.read_pool_size", 8_u32)?
        .set_default("auth.jwt_secret", "dev-insecure-change-me")?
        .set_default("auth.handoff_token_ttl_secs", 60_i64)?
        .set_default("auth.hmac_session_ttl_secs", 7_776_000_i64)? // 90 days
        .set_default("auth.hmac_skew_secs", 300_i64)?
        .set_default("auth.nonce_ttl_secs", 300_i64)?
        .set_default("auth.otp_ttl_secs", 300_i64)?
        .set_default("auth.otp_wait_secs", 300_i64)?
        .set_default("auth.backup_code_count", 10_i64)?
        .set_default("auth.backup_code_regen_floor", 8_i64)?
        .set_default("auth.backup_code_base_wait_secs", 60_i64)?
        .set_default("auth.backup_code_backoff_base", 1.8_f64)?
        .set_default("auth.refresh_token_ttl_secs", 7_776_000_i64)? // 90 days
        .set_default("auth.magic_link_ttl_secs", 300_i64)?
        .set_default("auth.registration_mode", "open")?
        .set_default(
            "auth.allowed_email_suffixes",
            Vec::<String>::new(),
        )?
        .set_default("auth.admin_emails", Vec::<String>::new())?
        .set_default(
            "rate_limits.token_exchange_per_15min",
            5_i64,
        )?
        .set_default("rate_limits.token_refresh_per_hour", 10_i64)?
        .set_default("meetings.admission_cooldown_secs", 30_i64)?
        .set_default("meetings.lookahead_secs", 1_800_i64)? // 30 min
        .set_default("housekeeping.sweep_interval_secs", 300_i64)?
        .set_default("housekeeping.envelope_retention_secs", 2_592_000_i64)? // 30 days
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (RELAY__AUTH__JWT_SECRET, RELAY__STORAGE__DB_PATH, etc.)
        .add_source(
            config::Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Initialize config directly from a struct, for tests.
#[cfg(any(test, feature = "test-util"))]
pub fn init_for_test(cfg: AppConfig) -> &'static AppConfig {
    CONFIG.get_or_init(|| cfg)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub rate_limits: RateLimitConfig,
    pub meetings: MeetingConfig,
    pub housekeeping: HousekeepingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub api_port: u16,
    pub signaling_port: u16,
    pub admin_port: u16,
    /// Also used as the WebAuthn RP-ID and canonical HTTPS origin.
    pub domain: String,
    /// Extra allowed WebAuthn origins for local development (e.g. `http://localhost:5173`).
    pub dev_origins: Vec<String>,
    /// Literal `android:apk-key-hash:<hash>` origins for the native Android
    /// app's Custom Tab passkey flow, carried verbatim in clientDataJSON.
    pub android_apk_key_hash_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Path to the embedded SQLite database file.
    pub db_path: String,
    pub busy_timeout_ms: i64,
    pub cache_kib: i64,
    /// Number of pooled read-only connections.
    pub read_pool_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Signing secret for hand-off tokens and magic links (HS256 / HMAC-SHA256).
    pub jwt_secret: String,
    pub handoff_token_ttl_secs: i64,
    pub hmac_session_ttl_secs: i64,
    /// Maximum allowed clock skew for HMAC-signed request timestamps.
    pub hmac_skew_secs: i64,
    pub nonce_ttl_secs: i64,
    pub otp_ttl_secs: i64,
    pub otp_wait_secs: i64,
    pub backup_code_count: i64,
    pub backup_code_regen_floor: i64,
    pub backup_code_base_wait_secs: i64,
    pub backup_code_backoff_base: f64,
    pub refresh_token_ttl_secs: i64,
    pub magic_link_ttl_secs: i64,
    pub registration_mode: String,
    pub allowed_email_suffixes: Vec<String>,
    pub admin_emails: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub token_exchange_per_15min: u32,
    pub token_refresh_per_hour: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MeetingConfig {
    pub admission_cooldown_secs: i64,
    pub lookahead_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HousekeepingConfig {
    pub sweep_interval_secs: u64,
    pub envelope_retention_secs: i64,
}
