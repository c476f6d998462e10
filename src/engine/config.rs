//! Runtime settings, read once from the environment (or a `.env` file via
//! `dotenvy`) and passed by value into component constructors.

use crate::engine::dedup::DedupSettings;
use crate::engine::format::ValueTiers;
use crate::engine::rate_limit::RateLimits;
use crate::engine::token::TokenPolicy;
use anyhow::{bail, Result};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORTALS_API_URL: &str = "https://portals-market.com/api/market/actions/";
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Chat credentials; the monitor refuses to start without them.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub bot_token: String,
    pub channel: String,
    pub api_url: String,
}

impl ChatConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let bot_token = get("BOT_TOKEN").map(|s| s.trim().to_string()).unwrap_or_default();
        let channel = get("CHANNEL_USERNAME")
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if bot_token.is_empty() {
            bail!("BOT_TOKEN is not set");
        }
        if channel.is_empty() {
            bail!("CHANNEL_USERNAME is not set");
        }
        Ok(Self {
            bot_token,
            channel,
            api_url: get("TELEGRAM_API_URL").unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<PathBuf>,
    pub max_bytes: u64,
    pub backups: usize,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub api_url: String,
    pub fetch_limit: usize,
    pub request_timeout: Duration,
    pub retry_attempts: u32,

    pub check_interval: Duration,
    pub waiting_interval: Duration,
    pub bootstrap_interval: Duration,
    pub message_delay: Duration,
    pub batch_delay: Duration,

    pub rate_limits: RateLimits,
    pub emergency_cooldown: Duration,

    pub token_file: PathBuf,
    pub token_source_cmd: Option<String>,
    pub token_skip_validation: Duration,
    pub token_refresh_interval: Duration,
    pub token_max_age: Duration,
    pub token_acquire_timeout: Duration,
    pub token_refresh_cycles: u64,
    pub token_retry_delay: Duration,

    pub state_file: PathBuf,
    pub price_change_threshold: Decimal,
    pub duplicate_memory: Duration,
    pub similar_window: Duration,
    pub seen_actions_max: usize,
    pub bootstrap_batch_size: usize,

    pub pin_threshold: Decimal,
    pub high_value_threshold: Decimal,
    pub ultra_value_threshold: Decimal,

    pub max_consecutive_failures: u32,
    /// Error sleep is `min(error_backoff_cap, error_backoff_unit * failures)`.
    pub error_backoff_unit: Duration,
    pub error_backoff_cap: Duration,

    pub log: LogSettings,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_lookup(&|_| None)
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&|k| std::env::var(k).ok())
    }

    /// Unset or unparseable keys fall back to their defaults.
    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Self {
        let num = |key: &str, default: f64| -> f64 { parse_or(get, key, default) };
        let secs = |key: &str, default: f64| -> Duration {
            Duration::try_from_secs_f64(num(key, default))
                .unwrap_or_else(|_| Duration::from_secs_f64(default))
        };
        let dec = |key: &str, default: &str| -> Decimal {
            parse_or(get, key, Decimal::from_str(default).unwrap_or_default())
        };

        let log_file = get("LOG_FILE").unwrap_or_else(|| "nft_monitor.log".to_string());

        Self {
            api_url: get("PORTALS_API_URL").unwrap_or_else(|| DEFAULT_PORTALS_API_URL.to_string()),
            fetch_limit: parse_or(get, "FETCH_LIMIT", 20),
            request_timeout: secs("REQUEST_TIMEOUT", 15.0),
            retry_attempts: parse_or(get, "RETRY_ATTEMPTS", 2),

            check_interval: secs("CHECK_INTERVAL", 5.0),
            waiting_interval: secs("WAITING_INTERVAL", 10.0),
            bootstrap_interval: secs("BOOTSTRAP_INTERVAL", 2.0),
            message_delay: secs("MESSAGE_DELAY", 1.0),
            batch_delay: secs("BATCH_DELAY", 0.5),

            rate_limits: RateLimits {
                per_minute: parse_or(get, "MAX_MESSAGES_PER_MINUTE", 8),
                per_hour: parse_or(get, "MAX_MESSAGES_PER_HOUR", 150),
                per_day: parse_or(get, "MAX_DAILY_MESSAGES", 2000),
            },
            emergency_cooldown: secs("EMERGENCY_COOLDOWN", 300.0),

            token_file: get("TOKEN_FILE")
                .unwrap_or_else(|| "auth_token.txt".to_string())
                .into(),
            token_source_cmd: get("TOKEN_SOURCE_CMD").filter(|s| !s.trim().is_empty()),
            token_skip_validation: secs("TOKEN_SKIP_VALIDATION", 1500.0),
            token_refresh_interval: secs("TOKEN_REFRESH_INTERVAL", 3600.0),
            token_max_age: secs("TOKEN_MAX_AGE", 7200.0),
            token_acquire_timeout: secs("TOKEN_ACQUIRE_TIMEOUT", 180.0),
            token_refresh_cycles: parse_or(get, "TOKEN_REFRESH_CYCLES", 720),
            token_retry_delay: Duration::from_secs(10),

            state_file: get("STATE_FILE")
                .unwrap_or_else(|| "monitor_state.json".to_string())
                .into(),
            price_change_threshold: dec("PRICE_CHANGE_THRESHOLD", "0.01"),
            duplicate_memory: secs("DUPLICATE_MEMORY_HOURS", 24.0)
                .checked_mul(3600)
                .unwrap_or(Duration::from_secs(24 * 3600)),
            similar_window: secs("SIMILAR_WINDOW_SECS", 300.0),
            seen_actions_max: parse_or(get, "SEEN_ACTIONS_MAX", 5000),
            bootstrap_batch_size: parse_or(get, "BOOTSTRAP_BATCH_SIZE", 5),

            pin_threshold: dec("PIN_MESSAGE_THRESHOLD", "100.0"),
            high_value_threshold: dec("HIGH_VALUE_THRESHOLD", "50.0"),
            ultra_value_threshold: dec("ULTRA_VALUE_THRESHOLD", "200.0"),

            max_consecutive_failures: parse_or(get, "MAX_CONSECUTIVE_FAILURES", 10),
            error_backoff_unit: Duration::from_secs(5),
            error_backoff_cap: Duration::from_secs(30),

            log: LogSettings {
                level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                file: (!log_file.trim().is_empty()).then(|| PathBuf::from(log_file)),
                max_bytes: parse_or(get, "LOG_MAX_SIZE_MB", 10u64).saturating_mul(1024 * 1024),
                backups: parse_or(get, "LOG_BACKUP_COUNT", 5),
            },
        }
    }

    pub fn dedup_settings(&self) -> DedupSettings {
        DedupSettings {
            price_epsilon: self.price_change_threshold,
            retention: self.duplicate_memory,
            similar_window: self.similar_window,
        }
    }

    pub fn token_policy(&self) -> TokenPolicy {
        TokenPolicy {
            skip_validation: self.token_skip_validation,
            refresh_interval: self.token_refresh_interval,
            max_age: self.token_max_age,
            acquire_timeout: self.token_acquire_timeout,
        }
    }

    pub fn value_tiers(&self) -> ValueTiers {
        ValueTiers {
            high: self.high_value_threshold,
            ultra: self.ultra_value_threshold,
        }
    }
}

fn parse_or<T: FromStr>(get: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
