use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};

pub const FEED_TOPIC: &str = "marketorders.deduped";

/// Keep-alive ping interval on the order feed (seconds).
pub const FEED_PING_INTERVAL_SECS: u64 = 30;

/// No frame at all for this long is treated as a dead connection (seconds).
pub const FEED_SILENCE_TIMEOUT_SECS: u64 = 120;

/// Reconnect backoff ladder in milliseconds. The last value repeats forever.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[500, 1_000, 2_000, 5_000, 10_000, 30_000];

/// Log a throttled warning for the first N occurrences, then every Nth thereafter.
pub const WARN_FIRST_N: u64 = 10;
pub const WARN_EVERY_N: u64 = 1_000;

/// Hourly history is only mirrored for this many recent days (capped by retention).
pub const HOURLY_HISTORY_DAYS: i64 = 7;

/// Symmetric jitter applied to every retry delay (±30%).
pub const RETRY_JITTER: f64 = 0.3;

/// Aggregate-price API region. Selects the default API host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    West,
    East,
    Europe,
}

impl Region {
    pub fn host(&self) -> &'static str {
        match self {
            Region::West => "west.albion-online-data.com",
            Region::East => "east.albion-online-data.com",
            Region::Europe => "europe.albion-online-data.com",
        }
    }
}

impl FromStr for Region {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "west" | "americas" => Ok(Region::West),
            "east" | "asia" => Ok(Region::East),
            "europe" | "eu" => Ok(Region::Europe),
            other => Err(AppError::Config(format!(
                "REGION must be one of west, east, europe (got \"{other}\")"
            ))),
        }
    }
}

/// Retry policy for the remote API client.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    /// Wait applied on a 429 without a usable Retry-After header.
    pub rate_limit_default: Duration,
    pub request_timeout: Duration,
}

/// Economics used by the arbitrage calculator.
#[derive(Debug, Clone)]
pub struct TradeSettings {
    pub carry_capacity_kg: f64,
    /// Destination-market tax on sales, in basis points (400 = 4%).
    pub sales_tax_bps: i64,
    pub round_trip_minutes: f64,
    /// Fixed transaction overhead per leg (buying, selling).
    pub leg_overhead_minutes: f64,
    /// Weight used for items missing from the catalog.
    pub default_item_weight_kg: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub region: Region,
    pub feed_url: String,
    pub feed_topic: String,
    pub feed_user: String,
    pub feed_password: String,
    pub api_base_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// JSON item catalog (ids + weights). Optional.
    pub item_catalog_path: Option<String>,
    /// Price history older than this is purged (HISTORY_RETENTION_DAYS)
    pub history_retention_days: i64,
    /// Upper bound for one batched request URL (MAX_URL_LENGTH)
    pub max_url_length: usize,
    pub latest_prices_interval: Duration,
    pub hourly_history_interval: Duration,
    pub daily_history_interval: Duration,
    pub expiry_sweep_interval: Duration,
    pub purge_interval: Duration,
    pub scan_interval: Duration,
    pub retry: RetrySettings,
    pub trade: TradeSettings,
    /// Locations routes must not pass through (DISALLOWED_LOCATIONS, comma-separated names or codes)
    pub disallowed_locations: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing required keys and malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let region: Region = required(&lookup, "REGION")?.parse()?;
        let feed_user = required(&lookup, "FEED_USER")?;
        let feed_password = required(&lookup, "FEED_PASSWORD")?;

        let api_base_url = lookup("API_BASE_URL")
            .unwrap_or_else(|| format!("https://{}", region.host()))
            .trim_end_matches('/')
            .to_string();
        let feed_url = lookup("FEED_URL").unwrap_or_else(|| format!("wss://{}/feed", region.host()));

        let retry = RetrySettings {
            initial_delay: Duration::from_millis(parse_or(&lookup, "RETRY_INITIAL_DELAY_MS", 1_000u64)?),
            max_delay: Duration::from_millis(parse_or(&lookup, "RETRY_MAX_DELAY_MS", 60_000u64)?),
            multiplier: parse_or(&lookup, "RETRY_MULTIPLIER", 2.0f64)?,
            max_retries: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 5u32)?,
            rate_limit_default: Duration::from_secs(parse_or(&lookup, "RATE_LIMIT_DEFAULT_SECS", 60u64)?),
            request_timeout: Duration::from_secs(parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 30u64)?),
        };
        if retry.multiplier < 1.0 {
            return Err(AppError::Config("RETRY_MULTIPLIER must be >= 1.0".to_string()));
        }

        let trade = TradeSettings {
            carry_capacity_kg: parse_or(&lookup, "CARRY_CAPACITY_KG", 1_000.0f64)?,
            sales_tax_bps: parse_or(&lookup, "SALES_TAX_BPS", 400i64)?,
            round_trip_minutes: parse_or(&lookup, "ROUND_TRIP_MINUTES", 20.0f64)?,
            leg_overhead_minutes: parse_or(&lookup, "LEG_OVERHEAD_MINUTES", 2.0f64)?,
            default_item_weight_kg: parse_or(&lookup, "DEFAULT_ITEM_WEIGHT_KG", 1.0f64)?,
        };
        if !(0..10_000).contains(&trade.sales_tax_bps) {
            return Err(AppError::Config("SALES_TAX_BPS must be in 0..10000".to_string()));
        }
        if trade.default_item_weight_kg <= 0.0 {
            return Err(AppError::Config("DEFAULT_ITEM_WEIGHT_KG must be positive".to_string()));
        }

        Ok(Self {
            region,
            feed_url,
            feed_topic: lookup("FEED_TOPIC").unwrap_or_else(|| FEED_TOPIC.to_string()),
            feed_user,
            feed_password,
            api_base_url,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            db_path: lookup("DB_PATH").unwrap_or_else(|| "market.db".to_string()),
            api_port: parse_or(&lookup, "API_PORT", 3000u16)?,
            item_catalog_path: lookup("ITEM_CATALOG_PATH").filter(|s| !s.trim().is_empty()),
            history_retention_days: parse_or(&lookup, "HISTORY_RETENTION_DAYS", 30i64)?,
            max_url_length: parse_or(&lookup, "MAX_URL_LENGTH", 4_096usize)?,
            latest_prices_interval: secs(&lookup, "LATEST_PRICES_INTERVAL_SECS", 300)?,
            hourly_history_interval: secs(&lookup, "HOURLY_HISTORY_INTERVAL_SECS", 3_600)?,
            daily_history_interval: secs(&lookup, "DAILY_HISTORY_INTERVAL_SECS", 21_600)?,
            expiry_sweep_interval: secs(&lookup, "EXPIRY_SWEEP_SECS", 60)?,
            purge_interval: secs(&lookup, "PURGE_INTERVAL_SECS", 3_600)?,
            scan_interval: secs(&lookup, "SCAN_INTERVAL_SECS", 300)?,
            retry,
            trade,
            disallowed_locations: lookup("DISALLOWED_LOCATIONS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    match lookup(key) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(AppError::Config(format!("{key} is required"))),
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{key} has an invalid value: \"{raw}\""))),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let v: u64 = parse_or(lookup, key, default)?;
    if v == 0 {
        return Err(AppError::Config(format!("{key} must be greater than zero")));
    }
    Ok(Duration::from_secs(v))
}
