//! BingX spot and perpetual swap (USDT-M, hedge mode) client.

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::signing::{hmac_sha256_hex, query_string, timestamp_ms};
use super::{
    ApiKeys, Balance, Exchange, ExchangeError, FuturesAccount, FuturesOrder, FuturesPosition,
    LotRules, OrderAck, PositionSide, SpotOrder, Venue, flex_decimal, step_from_precision,
};

pub struct Bingx {
    http: reqwest::Client,
    keys: ApiKeys,
    base: String,
}

impl Bingx {
    pub fn new(http: reqwest::Client, keys: ApiKeys, base: &str) -> Self {
        Self {
            http,
            keys,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn symbol(asset: &str, quote: &str) -> String {
        format!("{}-{}", asset.to_uppercase(), quote.to_uppercase())
    }

    fn signed_url(&self, path: &str, mut params: Vec<(&str, String)>) -> String {
        params.push(("timestamp", timestamp_ms().to_string()));
        let qs = query_string(&params);
        let signature = hmac_sha256_hex(&self.keys.api_secret, &qs);
        format!("{}{path}?{qs}&signature={signature}", self.base)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        let url = self.signed_url(path, params);
        let resp = self
            .http
            .request(method, &url)
            .header("X-BX-APIKEY", &self.keys.api_key)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        let env: Envelope = serde_json::from_str(&body).map_err(|_| ExchangeError::Api {
            venue: Venue::Bingx,
            code: i64::from(status.as_u16()),
            message: body.clone(),
        })?;
        into_data(env)
    }
}

#[derive(Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

fn into_data<T: DeserializeOwned>(env: Envelope) -> Result<T, ExchangeError> {
    if env.code != 0 {
        return Err(ExchangeError::Api {
            venue: Venue::Bingx,
            code: env.code,
            message: env.msg,
        });
    }
    Ok(serde_json::from_value(env.data)?)
}

#[derive(Deserialize)]
struct SpotBalances {
    #[serde(default)]
    balances: Vec<RawBalance>,
}

#[derive(Deserialize)]
struct RawBalance {
    asset: String,
    #[serde(default, deserialize_with = "flex_decimal")]
    free: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    locked: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotTicker {
    #[serde(deserialize_with = "flex_decimal")]
    last_price: Decimal,
}

#[derive(Deserialize)]
struct SpotSymbols {
    #[serde(default)]
    symbols: Vec<SpotSymbol>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotSymbol {
    symbol: String,
    #[serde(default, deserialize_with = "flex_decimal")]
    step_size: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    min_qty: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    max_qty: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    min_notional: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotOrderResponse {
    #[serde(deserialize_with = "string_or_number")]
    order_id: String,
    #[serde(default, deserialize_with = "flex_decimal")]
    executed_qty: Decimal,
}

#[derive(Deserialize)]
struct SwapBalanceWrapper {
    balance: SwapBalance,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapBalance {
    #[serde(default, deserialize_with = "flex_decimal")]
    balance: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    unrealized_profit: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    available_margin: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapPosition {
    symbol: String,
    position_side: String,
    #[serde(default, deserialize_with = "flex_decimal")]
    position_amt: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    avg_price: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    mark_price: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    unrealized_profit: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    leverage: Decimal,
}

impl SwapPosition {
    fn into_position(self) -> Option<FuturesPosition> {
        let side = match self.position_side.as_str() {
            "LONG" => PositionSide::Long,
            "SHORT" => PositionSide::Short,
            _ if self.position_amt > Decimal::ZERO => PositionSide::Long,
            _ if self.position_amt < Decimal::ZERO => PositionSide::Short,
            _ => return None,
        };
        if self.position_amt.is_zero() {
            return None;
        }
        Some(FuturesPosition {
            symbol: self.symbol,
            side,
            size: self.position_amt.abs(),
            entry_price: self.avg_price,
            mark_price: self.mark_price,
            unrealized_pnl: self.unrealized_profit,
            leverage: self.leverage,
        })
    }
}

#[derive(Deserialize)]
struct SwapPrice {
    #[serde(deserialize_with = "flex_decimal")]
    price: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Contract {
    symbol: String,
    #[serde(default)]
    quantity_precision: u32,
    #[serde(default, deserialize_with = "flex_decimal")]
    trade_min_quantity: Decimal,
    #[serde(default, rename = "tradeMinUSDT", deserialize_with = "flex_decimal")]
    trade_min_usdt: Decimal,
}

#[derive(Deserialize)]
struct SwapOrderWrapper {
    order: SwapOrderResponse,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapOrderResponse {
    #[serde(deserialize_with = "string_or_number")]
    order_id: String,
}

/// BingX order ids exceed 2^53 and arrive as either strings or numbers.
fn string_or_number<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected order id {other}"))),
    }
}

fn position_side_str(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "LONG",
        PositionSide::Short => "SHORT",
    }
}

#[async_trait]
impl Exchange for Bingx {
    fn venue(&self) -> Venue {
        Venue::Bingx
    }

    async fn spot_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let data: SpotBalances = self
            .call(Method::GET, "/openApi/spot/v1/account/balance", vec![])
            .await?;
        Ok(data
            .balances
            .into_iter()
            .filter(|b| !(b.free + b.locked).is_zero())
            .map(|b| Balance {
                asset: b.asset,
                free: b.free,
                locked: b.locked,
            })
            .collect())
    }

    async fn spot_price(&self, asset: &str, quote: &str) -> Result<Decimal, ExchangeError> {
        let symbol = Self::symbol(asset, quote);
        let tickers: Vec<SpotTicker> = self
            .call(Method::GET, "/openApi/spot/v1/ticker/24hr", vec![("symbol", symbol.clone())])
            .await?;
        tickers
            .into_iter()
            .next()
            .map(|t| t.last_price)
            .ok_or(ExchangeError::UnknownSymbol(symbol))
    }

    async fn spot_rules(&self, asset: &str, quote: &str) -> Result<LotRules, ExchangeError> {
        let symbol = Self::symbol(asset, quote);
        let data: SpotSymbols = self
            .call(Method::GET, "/openApi/spot/v1/common/symbols", vec![("symbol", symbol.clone())])
            .await?;
        let sym = data
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or(ExchangeError::UnknownSymbol(symbol))?;
        Ok(LotRules {
            step: sym.step_size,
            min_qty: sym.min_qty,
            max_qty: (sym.max_qty > Decimal::ZERO).then_some(sym.max_qty),
            min_notional: sym.min_notional,
        })
    }

    async fn place_spot_market(&self, order: &SpotOrder) -> Result<OrderAck, ExchangeError> {
        let resp: SpotOrderResponse = self
            .call(
                Method::POST,
                "/openApi/spot/v1/trade/order",
                vec![
                    ("symbol", Self::symbol(&order.asset, &order.quote)),
                    ("side", order.side.as_upper().into()),
                    ("type", "MARKET".into()),
                    ("quantity", order.quantity.normalize().to_string()),
                ],
            )
            .await?;
        Ok(OrderAck {
            order_id: resp.order_id,
            filled_qty: Some(resp.executed_qty),
        })
    }

    async fn futures_account(&self, _quote: &str) -> Result<FuturesAccount, ExchangeError> {
        let wrapper: SwapBalanceWrapper = self
            .call(Method::GET, "/openApi/swap/v2/user/balance", vec![])
            .await?;
        let positions: Vec<SwapPosition> = self
            .call(Method::GET, "/openApi/swap/v2/user/positions", vec![])
            .await?;
        Ok(FuturesAccount {
            wallet_balance: wrapper.balance.balance,
            available: wrapper.balance.available_margin,
            unrealized_pnl: wrapper.balance.unrealized_profit,
            positions: positions
                .into_iter()
                .filter_map(SwapPosition::into_position)
                .collect(),
        })
    }

    async fn futures_price(&self, asset: &str, quote: &str) -> Result<Decimal, ExchangeError> {
        let price: SwapPrice = self
            .call(
                Method::GET,
                "/openApi/swap/v2/quote/price",
                vec![("symbol", Self::symbol(asset, quote))],
            )
            .await?;
        Ok(price.price)
    }

    async fn futures_rules(&self, asset: &str, quote: &str) -> Result<LotRules, ExchangeError> {
        let symbol = Self::symbol(asset, quote);
        let contracts: Vec<Contract> = self
            .call(Method::GET, "/openApi/swap/v2/quote/contracts", vec![("symbol", symbol.clone())])
            .await?;
        let c = contracts
            .into_iter()
            .find(|c| c.symbol == symbol)
            .ok_or(ExchangeError::UnknownSymbol(symbol))?;
        Ok(LotRules {
            step: step_from_precision(c.quantity_precision),
            min_qty: c.trade_min_quantity,
            max_qty: None,
            min_notional: c.trade_min_usdt,
        })
    }

    async fn set_leverage(&self, asset: &str, quote: &str, leverage: u32) -> Result<(), ExchangeError> {
        // Hedge mode keeps a separate leverage per side.
        for side in [PositionSide::Long, PositionSide::Short] {
            let _: Value = self
                .call(
                    Method::POST,
                    "/openApi/swap/v2/trade/leverage",
                    vec![
                        ("symbol", Self::symbol(asset, quote)),
                        ("side", position_side_str(side).into()),
                        ("leverage", leverage.to_string()),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    async fn place_futures_market(&self, order: &FuturesOrder) -> Result<OrderAck, ExchangeError> {
        // In hedge mode closing is expressed by positionSide, not reduceOnly.
        let resp: SwapOrderWrapper = self
            .call(
                Method::POST,
                "/openApi/swap/v2/trade/order",
                vec![
                    ("symbol", Self::symbol(&order.asset, &order.quote)),
                    ("side", order.side.as_upper().into()),
                    ("positionSide", position_side_str(order.position_side).into()),
                    ("type", "MARKET".into()),
                    ("quantity", order.quantity.normalize().to_string()),
                ],
            )
            .await?;
        Ok(OrderAck {
            order_id: resp.order.order_id,
            filled_qty: None,
        })
    }
}
