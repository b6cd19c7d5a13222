//! Bybit v5 client: unified wallet, linear perpetuals and FlexibleSaving earn.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::signing::{hmac_sha256_hex, query_string, timestamp_ms};
use super::{
    ApiKeys, Balance, EarnPosition, Exchange, ExchangeError, FuturesAccount, FuturesOrder,
    FuturesPosition, LotRules, OrderAck, OrderSide, PositionSide, SpotOrder, Venue, flex_decimal,
};

const RECV_WINDOW: &str = "5000";
/// "leverage not modified": the requested leverage is already set.
const LEVERAGE_UNCHANGED: i64 = 110043;

pub struct Bybit {
    http: reqwest::Client,
    keys: ApiKeys,
    base: String,
}

#[derive(Clone, Copy)]
enum Category {
    Spot,
    Linear,
}

impl Category {
    fn as_str(self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Linear => "linear",
        }
    }
}

impl Bybit {
    pub fn new(http: reqwest::Client, keys: ApiKeys, base: &str) -> Self {
        Self {
            http,
            keys,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn symbol(asset: &str, quote: &str) -> String {
        format!("{}{}", asset.to_uppercase(), quote.to_uppercase())
    }

    /// `HMAC(secret, timestamp + api_key + recv_window + payload)`.
    fn sign(&self, timestamp: &str, payload: &str) -> String {
        let prehash = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.keys.api_key);
        hmac_sha256_hex(&self.keys.api_secret, &prehash)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let qs = query_string(params);
        let ts = timestamp_ms().to_string();
        let resp = self
            .http
            .get(format!("{}{path}?{qs}", self.base))
            .header("X-BAPI-API-KEY", &self.keys.api_key)
            .header("X-BAPI-TIMESTAMP", &ts)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", self.sign(&ts, &qs))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        let envelope = read_envelope(resp).await?;
        into_result(envelope, &[])
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
        accepted_codes: &[i64],
    ) -> Result<T, ExchangeError> {
        let body = body.to_string();
        let ts = timestamp_ms().to_string();
        let resp = self
            .http
            .post(format!("{}{path}", self.base))
            .header("X-BAPI-API-KEY", &self.keys.api_key)
            .header("X-BAPI-TIMESTAMP", &ts)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", self.sign(&ts, &body))
            .header("Content-Type", "application/json")
            .body(body)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        let envelope = read_envelope(resp).await?;
        into_result(envelope, accepted_codes)
    }

    async fn wallet(&self) -> Result<WalletAccount, ExchangeError> {
        let page: ListPage<WalletAccount> = self
            .get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".into())],
            )
            .await?;
        page.list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Decode("bybit wallet-balance returned no account".into()))
    }

    async fn last_price(&self, category: Category, symbol: String) -> Result<Decimal, ExchangeError> {
        let page: ListPage<Ticker> = self
            .get(
                "/v5/market/tickers",
                &[("category", category.as_str().into()), ("symbol", symbol.clone())],
            )
            .await?;
        page.list
            .into_iter()
            .next()
            .map(|t| t.last_price)
            .ok_or(ExchangeError::UnknownSymbol(symbol))
    }

    async fn rules(&self, category: Category, symbol: String) -> Result<LotRules, ExchangeError> {
        let page: ListPage<Instrument> = self
            .get(
                "/v5/market/instruments-info",
                &[("category", category.as_str().into()), ("symbol", symbol.clone())],
            )
            .await?;
        let inst = page
            .list
            .into_iter()
            .next()
            .ok_or(ExchangeError::UnknownSymbol(symbol))?;
        Ok(inst.lot_size_filter.into_rules())
    }

    async fn create_order(&self, body: Value) -> Result<OrderAck, ExchangeError> {
        let created: CreatedOrder = self.post("/v5/order/create", body, &[]).await?;
        Ok(OrderAck {
            order_id: created.order_id,
            filled_qty: None,
        })
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

async fn read_envelope(resp: reqwest::Response) -> Result<Envelope, ExchangeError> {
    let status = resp.status();
    let body = resp.text().await?;
    serde_json::from_str(&body).map_err(|_| ExchangeError::Api {
        venue: Venue::Bybit,
        code: i64::from(status.as_u16()),
        message: body,
    })
}

fn into_result<T: DeserializeOwned>(env: Envelope, accepted: &[i64]) -> Result<T, ExchangeError> {
    if env.ret_code != 0 && !accepted.contains(&env.ret_code) {
        return Err(ExchangeError::Api {
            venue: Venue::Bybit,
            code: env.ret_code,
            message: env.ret_msg,
        });
    }
    // Accepted non-zero codes carry an empty result object.
    let result = if env.result.is_null() { json!({}) } else { env.result };
    Ok(serde_json::from_value(result)?)
}

#[derive(Deserialize)]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletAccount {
    #[serde(default, deserialize_with = "flex_decimal")]
    total_wallet_balance: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    total_available_balance: Decimal,
    #[serde(default, rename = "totalPerpUPL", deserialize_with = "flex_decimal")]
    total_perp_upl: Decimal,
    #[serde(default)]
    coin: Vec<WalletCoin>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletCoin {
    coin: String,
    #[serde(default, deserialize_with = "flex_decimal")]
    wallet_balance: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    locked: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    #[serde(deserialize_with = "flex_decimal")]
    last_price: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    lot_size_filter: LotSizeFilter,
}

/// Spot instruments report `basePrecision`/`minOrderAmt`; linear ones report
/// `qtyStep`/`minNotionalValue`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    #[serde(default, deserialize_with = "flex_decimal")]
    base_precision: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    qty_step: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    min_order_qty: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    max_order_qty: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    min_order_amt: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    min_notional_value: Decimal,
}

impl LotSizeFilter {
    fn into_rules(self) -> LotRules {
        let step = if self.qty_step.is_zero() {
            self.base_precision
        } else {
            self.qty_step
        };
        LotRules {
            step,
            min_qty: self.min_order_qty,
            max_qty: (self.max_order_qty > Decimal::ZERO).then_some(self.max_order_qty),
            min_notional: self.min_order_amt.max(self.min_notional_value),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default, deserialize_with = "flex_decimal")]
    size: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    avg_price: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    mark_price: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    unrealised_pnl: Decimal,
    #[serde(default, deserialize_with = "flex_decimal")]
    leverage: Decimal,
}

impl RawPosition {
    fn into_position(self) -> Option<FuturesPosition> {
        let side = match self.side.as_str() {
            "Buy" => PositionSide::Long,
            "Sell" => PositionSide::Short,
            _ => return None,
        };
        if self.size.is_zero() {
            return None;
        }
        Some(FuturesPosition {
            symbol: self.symbol,
            side,
            size: self.size,
            entry_price: self.avg_price,
            mark_price: self.mark_price,
            unrealized_pnl: self.unrealised_pnl,
            leverage: self.leverage,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedOrder {
    order_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EarnRow {
    coin: String,
    product_id: String,
    #[serde(default, deserialize_with = "flex_decimal")]
    amount: Decimal,
}

#[async_trait]
impl Exchange for Bybit {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    fn unified_margin(&self) -> bool {
        true
    }

    async fn spot_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let wallet = self.wallet().await?;
        Ok(wallet
            .coin
            .into_iter()
            .filter(|c| !c.wallet_balance.is_zero())
            .map(|c| Balance {
                asset: c.coin,
                free: (c.wallet_balance - c.locked).max(Decimal::ZERO),
                locked: c.locked,
            })
            .collect())
    }

    async fn spot_price(&self, asset: &str, quote: &str) -> Result<Decimal, ExchangeError> {
        self.last_price(Category::Spot, Self::symbol(asset, quote)).await
    }

    async fn spot_rules(&self, asset: &str, quote: &str) -> Result<LotRules, ExchangeError> {
        self.rules(Category::Spot, Self::symbol(asset, quote)).await
    }

    async fn place_spot_market(&self, order: &SpotOrder) -> Result<OrderAck, ExchangeError> {
        self.create_order(json!({
            "category": "spot",
            "symbol": Self::symbol(&order.asset, &order.quote),
            "side": side_str(order.side),
            "orderType": "Market",
            "qty": order.quantity.normalize().to_string(),
            "marketUnit": "baseCoin",
        }))
        .await
    }

    async fn earn_positions(&self) -> Result<Vec<EarnPosition>, ExchangeError> {
        let page: ListPage<EarnRow> = self
            .get("/v5/earn/position", &[("category", "FlexibleSaving".into())])
            .await?;
        Ok(page
            .list
            .into_iter()
            .filter(|r| !r.amount.is_zero())
            .map(|r| EarnPosition {
                asset: r.coin,
                product_id: r.product_id,
                amount: r.amount,
            })
            .collect())
    }

    async fn redeem_earn(
        &self,
        position: &EarnPosition,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        let _: Value = self
            .post(
                "/v5/earn/place-order",
                json!({
                    "category": "FlexibleSaving",
                    "orderType": "Redeem",
                    "accountType": "UNIFIED",
                    "amount": amount.min(position.amount).normalize().to_string(),
                    "coin": position.asset,
                    "productId": position.product_id,
                    "orderLinkId": uuid::Uuid::new_v4().simple().to_string(),
                }),
                &[],
            )
            .await?;
        Ok(())
    }

    async fn futures_account(&self, quote: &str) -> Result<FuturesAccount, ExchangeError> {
        let wallet = self.wallet().await?;
        let page: ListPage<RawPosition> = self
            .get(
                "/v5/position/list",
                &[("category", "linear".into()), ("settleCoin", quote.to_uppercase())],
            )
            .await?;
        Ok(FuturesAccount {
            wallet_balance: wallet.total_wallet_balance,
            available: wallet.total_available_balance,
            unrealized_pnl: wallet.total_perp_upl,
            positions: page
                .list
                .into_iter()
                .filter_map(RawPosition::into_position)
                .collect(),
        })
    }

    async fn futures_price(&self, asset: &str, quote: &str) -> Result<Decimal, ExchangeError> {
        self.last_price(Category::Linear, Self::symbol(asset, quote)).await
    }

    async fn futures_rules(&self, asset: &str, quote: &str) -> Result<LotRules, ExchangeError> {
        self.rules(Category::Linear, Self::symbol(asset, quote)).await
    }

    async fn set_leverage(&self, asset: &str, quote: &str, leverage: u32) -> Result<(), ExchangeError> {
        let lev = leverage.to_string();
        let _: Value = self
            .post(
                "/v5/position/set-leverage",
                json!({
                    "category": "linear",
                    "symbol": Self::symbol(asset, quote),
                    "buyLeverage": lev,
                    "sellLeverage": lev,
                }),
                &[LEVERAGE_UNCHANGED],
            )
            .await?;
        Ok(())
    }

    async fn place_futures_market(&self, order: &FuturesOrder) -> Result<OrderAck, ExchangeError> {
        // One-way mode: positionIdx 0, direction carried by `side`.
        self.create_order(json!({
            "category": "linear",
            "symbol": Self::symbol(&order.asset, &order.quote),
            "side": side_str(order.side),
            "orderType": "Market",
            "qty": order.quantity.normalize().to_string(),
            "positionIdx": 0,
            "reduceOnly": order.reduce_only,
        }))
        .await
    }
}
