//! Exchange REST integrations.
//!
//! Every venue is exposed through the [`Exchange`] trait so the rebalancing
//! executor and the portfolio aggregator never branch on venue. A venue that
//! doesn't offer a wallet answers with [`ExchangeError::Unsupported`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

pub mod binance;
pub mod bingx;
pub mod bybit;
mod signing;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Bingx,
}

impl Venue {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
            Self::Bingx => "bingx",
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Venue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "bybit" => Ok(Self::Bybit),
            "bingx" => Ok(Self::Bingx),
            other => Err(format!("unknown exchange '{other}'. Allowed: binance, bybit, bingx")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{venue} rejected request ({code}): {message}")]
    Api {
        venue: Venue,
        code: i64,
        message: String,
    },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("{venue} does not support {what}")]
    Unsupported { venue: Venue, what: &'static str },
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
}

impl ExchangeError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// API key pair for one exchange account. Never logged in full.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeys {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiKeys {
    /// Last four characters of the key, for display.
    pub fn hint(&self) -> String {
        let n = self.api_key.chars().count();
        let tail: String = self.api_key.chars().skip(n.saturating_sub(4)).collect();
        format!("…{tail}")
    }
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeys")
            .field("api_key", &self.hint())
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// REST base URLs, overridable for testnets.
#[derive(Clone, Debug)]
pub struct Endpoints {
    pub binance: String,
    pub bybit: String,
    pub bingx: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            binance: "https://api.binance.com".into(),
            bybit: "https://api.bybit.com".into(),
            bingx: "https://open-api.bingx.com".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// Funds parked in a flexible earn/savings product, redeemable on demand.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EarnPosition {
    pub asset: String,
    pub product_id: String,
    pub amount: Decimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_upper(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that increases a position on this side.
    pub fn opening_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    pub fn closing_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FuturesPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FuturesAccount {
    pub wallet_balance: Decimal,
    pub available: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<FuturesPosition>,
}

impl FuturesAccount {
    pub fn equity(&self) -> Decimal {
        self.wallet_balance + self.unrealized_pnl
    }
}

/// Order-size constraints for one symbol.
#[derive(Clone, Debug, PartialEq)]
pub struct LotRules {
    pub step: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Option<Decimal>,
    pub min_notional: Decimal,
}

#[derive(Clone, Debug)]
pub struct SpotOrder {
    pub asset: String,
    pub quote: String,
    pub side: OrderSide,
    pub quantity: Decimal,
}

#[derive(Clone, Debug)]
pub struct FuturesOrder {
    pub asset: String,
    pub quote: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub quantity: Decimal,
    pub reduce_only: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderAck {
    pub order_id: String,
    pub filled_qty: Option<Decimal>,
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn venue(&self) -> Venue;

    /// True when futures margin and spot coins are one wallet (Bybit UTA), so
    /// the futures wallet balance must not be added on top of spot holdings.
    fn unified_margin(&self) -> bool {
        false
    }

    async fn spot_balances(&self) -> Result<Vec<Balance>, ExchangeError>;

    async fn spot_price(&self, asset: &str, quote: &str) -> Result<Decimal, ExchangeError>;

    async fn spot_rules(&self, asset: &str, quote: &str) -> Result<LotRules, ExchangeError>;

    async fn place_spot_market(&self, order: &SpotOrder) -> Result<OrderAck, ExchangeError>;

    async fn earn_positions(&self) -> Result<Vec<EarnPosition>, ExchangeError> {
        Err(self.unsupported("earn wallets"))
    }

    async fn redeem_earn(
        &self,
        _position: &EarnPosition,
        _amount: Decimal,
    ) -> Result<(), ExchangeError> {
        Err(self.unsupported("earn redemption"))
    }

    async fn futures_account(&self, _quote: &str) -> Result<FuturesAccount, ExchangeError> {
        Err(self.unsupported("futures"))
    }

    async fn futures_price(&self, _asset: &str, _quote: &str) -> Result<Decimal, ExchangeError> {
        Err(self.unsupported("futures"))
    }

    async fn futures_rules(&self, _asset: &str, _quote: &str) -> Result<LotRules, ExchangeError> {
        Err(self.unsupported("futures"))
    }

    async fn set_leverage(
        &self,
        _asset: &str,
        _quote: &str,
        _leverage: u32,
    ) -> Result<(), ExchangeError> {
        Err(self.unsupported("futures"))
    }

    async fn place_futures_market(&self, _order: &FuturesOrder) -> Result<OrderAck, ExchangeError> {
        Err(self.unsupported("futures"))
    }

    fn unsupported(&self, what: &'static str) -> ExchangeError {
        ExchangeError::Unsupported {
            venue: self.venue(),
            what,
        }
    }
}

/// Builds the client for `venue`, sharing one HTTP connection pool.
pub fn connect(
    venue: Venue,
    keys: ApiKeys,
    endpoints: &Endpoints,
    http: reqwest::Client,
) -> Arc<dyn Exchange> {
    match venue {
        Venue::Binance => Arc::new(binance::Binance::new(http, keys, &endpoints.binance)),
        Venue::Bybit => Arc::new(bybit::Bybit::new(http, keys, &endpoints.bybit)),
        Venue::Bingx => Arc::new(bingx::Bingx::new(http, keys, &endpoints.bingx)),
    }
}

/// Parses venue decimals. Empty strings (Bybit uses them for "nothing") are zero.
pub(crate) fn parse_decimal(raw: &str) -> Result<Decimal, ExchangeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| ExchangeError::Decode(format!("not a decimal: {raw:?}")))
}

/// Serde adapter for fields sent either as JSON strings or numbers.
pub(crate) fn flex_decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }

    match Option::<Raw>::deserialize(d)? {
        None => Ok(Decimal::ZERO),
        Some(Raw::Str(s)) => parse_decimal(&s).map_err(serde::de::Error::custom),
        Some(Raw::Num(n)) => parse_decimal(&n.to_string()).map_err(serde::de::Error::custom),
    }
}

/// Step size for a venue that reports precision as a number of decimals.
pub(crate) fn step_from_precision(decimals: u32) -> Decimal {
    Decimal::new(1, decimals)
}
