use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;

use crate::exchange::sign::FreshnessScheme;

/// Exchanges cap the client order id length; the random suffix needs room.
pub const MAX_ORDER_ID_PREFIX_LEN: usize = 13;

#[derive(Debug, Parser)]
#[command(name = "laddr-rs", about = "Ladder market maker")]
pub struct Cli {
    /// Symbol to quote, overrides LADDR_SYMBOL
    pub symbol: Option<String>,

    /// Print intended orders without posting anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Immutable process configuration, built once at startup from the
/// environment (plus CLI overrides) and passed by reference everywhere.
/// There is no reload path: a supervisor restart picks up new values.
#[derive(Debug, Clone)]
pub struct Config {
    pub symbol: String,
    pub base_url: String,

    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub scheme: FreshnessScheme,
    pub login: Option<String>,
    pub password: Option<String>,
    pub otp_token: Option<String>,

    pub order_id_prefix: String,
    pub order_pairs: usize,
    pub order_start_size: i64,
    pub order_step_size: i64,
    pub random_order_size: bool,
    pub min_order_size: i64,
    pub max_order_size: i64,

    /// Distance between successive rungs, fractional (0.005 = 0.5%).
    pub interval: f64,
    /// Minimum spread to maintain between the two reference prices.
    pub min_spread: f64,
    pub maintain_spreads: bool,
    /// Fractional price drift beyond which a resting order is relisted.
    pub relist_interval: f64,

    pub check_position_limits: bool,
    pub min_position: i64,
    pub max_position: i64,

    pub loop_interval: Duration,
    pub api_error_interval: Duration,
    pub rest_timeout: Duration,
    pub snapshot_timeout: Duration,
    pub max_table_len: usize,

    pub dry_run: bool,
    pub dry_balance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "XBTUSD".to_string(),
            base_url: "https://testnet.bitmex.com/api/v1/".to_string(),
            api_key: None,
            api_secret: None,
            scheme: FreshnessScheme::Expires,
            login: None,
            password: None,
            otp_token: None,
            order_id_prefix: "laddr_".to_string(),
            order_pairs: 6,
            order_start_size: 100,
            order_step_size: 100,
            random_order_size: false,
            min_order_size: 100,
            max_order_size: 500,
            interval: 0.005,
            min_spread: 0.01,
            maintain_spreads: true,
            relist_interval: 0.01,
            check_position_limits: false,
            min_position: -500,
            max_position: 500,
            loop_interval: Duration::from_secs(5),
            api_error_interval: Duration::from_secs(3),
            rest_timeout: Duration::from_secs(7),
            snapshot_timeout: Duration::from_secs(30),
            max_table_len: 200,
            dry_run: false,
            dry_balance: 50.0,
        }
    }
}

impl Config {
    pub fn from_env(cli: Cli) -> Result<Self> {
        let d = Config::default();
        let mut cfg = Config {
            symbol: cli.symbol.unwrap_or(env_or("LADDR_SYMBOL", d.symbol)),
            base_url: env_or("LADDR_BASE_URL", d.base_url),
            api_key: env::var("LADDR_API_KEY").ok().filter(|v| !v.is_empty()),
            api_secret: env::var("LADDR_API_SECRET").ok().filter(|v| !v.is_empty()),
            scheme: parse_or("LADDR_AUTH_SCHEME", d.scheme)?,
            login: env::var("LADDR_LOGIN").ok().filter(|v| !v.is_empty()),
            password: env::var("LADDR_PASSWORD").ok().filter(|v| !v.is_empty()),
            otp_token: env::var("LADDR_OTP_TOKEN").ok().filter(|v| !v.is_empty()),
            order_id_prefix: env_or("LADDR_ORDER_ID_PREFIX", d.order_id_prefix),
            order_pairs: parse_or("LADDR_ORDER_PAIRS", d.order_pairs)?,
            order_start_size: parse_or("LADDR_ORDER_START_SIZE", d.order_start_size)?,
            order_step_size: parse_or("LADDR_ORDER_STEP_SIZE", d.order_step_size)?,
            random_order_size: parse_or("LADDR_RANDOM_ORDER_SIZE", d.random_order_size)?,
            min_order_size: parse_or("LADDR_MIN_ORDER_SIZE", d.min_order_size)?,
            max_order_size: parse_or("LADDR_MAX_ORDER_SIZE", d.max_order_size)?,
            interval: parse_or("LADDR_INTERVAL", d.interval)?,
            min_spread: parse_or("LADDR_MIN_SPREAD", d.min_spread)?,
            maintain_spreads: parse_or("LADDR_MAINTAIN_SPREADS", d.maintain_spreads)?,
            relist_interval: parse_or("LADDR_RELIST_INTERVAL", d.relist_interval)?,
            check_position_limits: parse_or("LADDR_CHECK_POSITION_LIMITS", d.check_position_limits)?,
            min_position: parse_or("LADDR_MIN_POSITION", d.min_position)?,
            max_position: parse_or("LADDR_MAX_POSITION", d.max_position)?,
            loop_interval: secs_or("LADDR_LOOP_INTERVAL_SECS", d.loop_interval)?,
            api_error_interval: secs_or("LADDR_API_ERROR_INTERVAL_SECS", d.api_error_interval)?,
            rest_timeout: secs_or("LADDR_REST_TIMEOUT_SECS", d.rest_timeout)?,
            snapshot_timeout: secs_or("LADDR_SNAPSHOT_TIMEOUT_SECS", d.snapshot_timeout)?,
            max_table_len: parse_or("LADDR_MAX_TABLE_LEN", d.max_table_len)?,
            dry_run: cli.dry_run || parse_or("LADDR_DRY_RUN", d.dry_run)?,
            dry_balance: parse_or("LADDR_DRY_BALANCE", d.dry_balance)?,
        };
        if !cfg.base_url.ends_with('/') {
            cfg.base_url.push('/');
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.order_id_prefix.len() > MAX_ORDER_ID_PREFIX_LEN {
            bail!(
                "LADDR_ORDER_ID_PREFIX must be at most {} characters long",
                MAX_ORDER_ID_PREFIX_LEN
            );
        }
        if self.api_key.is_some() != self.api_secret.is_some() {
            bail!("LADDR_API_KEY and LADDR_API_SECRET must be set together");
        }
        if self.api_key.is_none() && (self.login.is_none() || self.password.is_none()) {
            bail!("credentials required: either LADDR_API_KEY/LADDR_API_SECRET or LADDR_LOGIN/LADDR_PASSWORD");
        }
        if self.order_pairs == 0 {
            bail!("LADDR_ORDER_PAIRS must be positive");
        }
        if self.check_position_limits && self.min_position >= self.max_position {
            bail!("LADDR_MIN_POSITION must be below LADDR_MAX_POSITION");
        }
        if self.random_order_size && self.min_order_size > self.max_order_size {
            bail!("LADDR_MIN_ORDER_SIZE must not exceed LADDR_MAX_ORDER_SIZE");
        }
        Ok(())
    }

    /// True when websocket account topics can be subscribed.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

fn env_or(name: &str, default: String) -> String {
    env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {name}: {e}")),
        _ => Ok(default),
    }
}

fn secs_or(name: &str, default: Duration) -> Result<Duration> {
    let secs = parse_or(name, default.as_secs_f64())?;
    if secs <= 0.0 {
        bail!("{name} must be positive");
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            api_key: Some("key".into()),
            api_secret: Some("secret".into()),
            ..Config::default()
        }
    }

    #[test]
    fn prefix_length_is_bounded() {
        let cfg = Config {
            order_id_prefix: "way_too_long_prefix".into(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn key_and_secret_must_pair() {
        let cfg = Config {
            api_secret: None,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_login_is_an_accepted_identity() {
        let cfg = Config {
            api_key: None,
            api_secret: None,
            login: Some("mm@example.com".into()),
            password: Some("hunter2".into()),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
        assert!(!cfg.has_api_key());
    }

    #[test]
    fn position_limits_must_be_ordered() {
        let cfg = Config {
            check_position_limits: true,
            min_position: 100,
            max_position: 100,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }
}
