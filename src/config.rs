use std::env;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::exchange::Endpoints;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Process configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    pub jwt_secret: Vec<u8>,
    pub admin_password: String,
    pub vault_key: String,
    pub tradingview_secret: String,
    pub quote_asset: String,
    pub redeem_settle: Duration,
    pub fee_buffer: Decimal,
    pub max_parallel_accounts: usize,
    pub endpoints: Endpoints,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Endpoints::default();
        Ok(Self {
            port: parsed("API_PORT", 3001)?,
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "data/rebalance.db".into()),
            jwt_secret: required("JWT_SECRET")?.into_bytes(),
            admin_password: required("ADMIN_PASSWORD")?,
            vault_key: required("VAULT_KEY")?,
            tradingview_secret: env::var("TRADINGVIEW_SECRET").unwrap_or_default(),
            quote_asset: env::var("QUOTE_ASSET")
                .map(|q| q.to_uppercase())
                .unwrap_or_else(|_| "USDT".into()),
            redeem_settle: Duration::from_millis(parsed("REDEEM_SETTLE_MS", 1500u64)?),
            fee_buffer: parsed("FEE_BUFFER", Decimal::new(2, 3))?,
            max_parallel_accounts: parsed("MAX_PARALLEL_ACCOUNTS", 4usize)?.max(1),
            endpoints: Endpoints {
                binance: env::var("BINANCE_BASE_URL").unwrap_or(defaults.binance),
                bybit: env::var("BYBIT_BASE_URL").unwrap_or(defaults.bybit),
                bingx: env::var("BINGX_BASE_URL").unwrap_or(defaults.bingx),
            },
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}
