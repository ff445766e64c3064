//! Service configuration sourced from environment variables.
//!
//! `from_env` reads the process environment (after `dotenv` has loaded any
//! `.env` file); `from_lookup` takes any key lookup so tests can pass a map.

use crate::error::ConfigError;
use crate::escrow::DEFAULT_ESCROW_THRESHOLD;
use crate::health::HealthMonitorConfig;
use crate::orders::{CreditPackage, PackageCatalog};
use crate::rate_limit::RateLimitRule;
use crate::store::PostgresConfig;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Used to sign and verify payments when no gateway secret is configured.
pub const DEV_SIGNING_SECRET: &str = "credit-service-dev-secret";

pub const DEFAULT_PACKAGES: &str = "starter:2:1000,pro:12:5000,enterprise:30:10000";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub key_id: Option<String>,
    pub key_secret: Option<String>,
    pub timeout: Duration,
    pub currency: String,
}

impl GatewayConfig {
    pub fn signing_secret(&self) -> &str {
        self.key_secret.as_deref().unwrap_or(DEV_SIGNING_SECRET)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub purchase: RateLimitRule,
    pub verify: RateLimitRule,
    pub unlock: RateLimitRule,
    pub transaction: RateLimitRule,
}

impl Default for RateLimits {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            purchase: RateLimitRule::new(10, minute),
            verify: RateLimitRule::new(20, minute),
            unlock: RateLimitRule::new(30, minute),
            transaction: RateLimitRule::new(20, minute),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub database: Option<PostgresConfig>,
    pub store_timeout: Duration,
    pub health: HealthMonitorConfig,
    pub gateway: GatewayConfig,
    pub jwt_secret: Option<String>,
    pub escrow_enabled: bool,
    pub escrow_threshold: i64,
    pub packages: PackageCatalog,
    pub unlock_cost: i64,
    pub rate_limits: RateLimits,
    pub rate_limit_sweep: Duration,
    pub cache_ttl: Duration,
    pub cache_sweep: Duration,
    pub resource_seed_path: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_connections: u32 = parse_or(&get, "DB_MAX_CONNECTIONS", 20)?;
        let store_timeout = Duration::from_millis(parse_or(&get, "STORE_TIMEOUT_MS", 5_000)?);
        let database = get("DATABASE_URL").map(|url| PostgresConfig {
            url,
            max_connections,
            acquire_timeout: store_timeout,
        });

        let pressure_ratio: f64 = parse_or(&get, "DB_PRESSURE_RATIO", 0.8)?;
        if !(pressure_ratio > 0.0 && pressure_ratio <= 1.0) {
            return Err(ConfigError::invalid("DB_PRESSURE_RATIO", "must be in (0, 1]"));
        }
        let health = HealthMonitorConfig {
            connection_ceiling: max_connections,
            pressure_ratio,
            idle_after: Duration::from_secs(parse_or(&get, "DB_IDLE_TERMINATE_SECS", 300)?),
            interval: Duration::from_secs(positive(&get, "DB_HEALTH_INTERVAL_SECS", 60)?),
        };

        let key_id = get("GATEWAY_KEY_ID");
        let key_secret = get("GATEWAY_KEY_SECRET");
        match (&key_id, &key_secret) {
            (Some(_), None) => {
                return Err(ConfigError::Incomplete("GATEWAY_KEY_ID", "GATEWAY_KEY_SECRET"))
            }
            (None, Some(_)) => {
                return Err(ConfigError::Incomplete("GATEWAY_KEY_SECRET", "GATEWAY_KEY_ID"))
            }
            _ => {}
        }
        let gateway = GatewayConfig {
            base_url: get("GATEWAY_BASE_URL")
                .unwrap_or_else(|| "https://api.razorpay.com/v1".to_string()),
            key_id,
            key_secret,
            timeout: Duration::from_millis(parse_or(&get, "GATEWAY_TIMEOUT_MS", 10_000)?),
            currency: get("BASE_CURRENCY").unwrap_or_else(|| "INR".to_string()),
        };

        let packages = parse_packages(
            get("CREDIT_PACKAGES")
                .as_deref()
                .unwrap_or(DEFAULT_PACKAGES),
        )?;

        let unlock_cost: i64 = parse_or(&get, "UNLOCK_COST", 1)?;
        if unlock_cost < 1 {
            return Err(ConfigError::invalid("UNLOCK_COST", "must be at least 1"));
        }

        let defaults = RateLimits::default();
        let rate_limits = RateLimits {
            purchase: rule_or(&get, "RATE_LIMIT_PURCHASE", defaults.purchase)?,
            verify: rule_or(&get, "RATE_LIMIT_VERIFY", defaults.verify)?,
            unlock: rule_or(&get, "RATE_LIMIT_UNLOCK", defaults.unlock)?,
            transaction: rule_or(&get, "RATE_LIMIT_TRANSACTION", defaults.transaction)?,
        };

        Ok(Self {
            port: parse_or(&get, "PORT", 8091)?,
            database,
            store_timeout,
            health,
            gateway,
            jwt_secret: get("JWT_SECRET"),
            escrow_enabled: flag_or(&get, "ESCROW_ENABLED", false)?,
            escrow_threshold: parse_or(&get, "ESCROW_THRESHOLD", DEFAULT_ESCROW_THRESHOLD)?,
            packages,
            unlock_cost,
            rate_limits,
            rate_limit_sweep: Duration::from_secs(positive(&get, "RATE_LIMIT_SWEEP_SECS", 60)?),
            cache_ttl: Duration::from_secs(parse_or(&get, "CACHE_TTL_SECS", 300)?),
            cache_sweep: Duration::from_secs(positive(&get, "CACHE_SWEEP_SECS", 60)?),
            resource_seed_path: get("RESOURCE_SEED_PATH").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
        None => Ok(default),
    }
}

/// Interval-like values; zero would make `tokio::time::interval` panic.
fn positive<G>(get: &G, key: &str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(get, key, default)?;
    if value == 0 {
        return Err(ConfigError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn flag_or<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::invalid(key, format!("`{v}` is not a boolean"))),
    }
}

/// `"<requests>/<window_secs>"`, e.g. `10/60`.
fn rule_or<G>(get: &G, key: &str, default: RateLimitRule) -> Result<RateLimitRule, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let (limit, window) = raw
        .split_once('/')
        .ok_or_else(|| ConfigError::invalid(key, "expected <requests>/<window_secs>"))?;
    let limit: u32 = limit
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, format!("requests: {e}")))?;
    let window: u64 = window
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, format!("window: {e}")))?;
    if window == 0 {
        return Err(ConfigError::invalid(key, "window must be greater than zero"));
    }
    Ok(RateLimitRule::new(limit, Duration::from_secs(window)))
}

/// `"<id>:<credits>:<amount>"` entries separated by commas.
pub fn parse_packages(raw: &str) -> Result<PackageCatalog, ConfigError> {
    let mut packages = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
        let [id, credits, amount] = parts.as_slice() else {
            return Err(ConfigError::invalid(
                "CREDIT_PACKAGES",
                format!("`{entry}` is not <id>:<credits>:<amount>"),
            ));
        };
        let credits: i64 = credits
            .parse()
            .map_err(|e| ConfigError::invalid("CREDIT_PACKAGES", format!("{entry}: {e}")))?;
        let amount: i64 = amount
            .parse()
            .map_err(|e| ConfigError::invalid("CREDIT_PACKAGES", format!("{entry}: {e}")))?;
        if id.is_empty() || credits <= 0 || amount <= 0 {
            return Err(ConfigError::invalid(
                "CREDIT_PACKAGES",
                format!("`{entry}` needs a name and positive credits and amount"),
            ));
        }
        packages.push(CreditPackage {
            id: (*id).to_string(),
            credits,
            amount,
        });
    }
    PackageCatalog::new(packages).map_err(|reason| ConfigError::invalid("CREDIT_PACKAGES", reason))
}
