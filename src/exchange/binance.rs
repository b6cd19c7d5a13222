//! Binance spot and Simple Earn (flexible) REST client.

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::signing::{hmac_sha256_hex, query_string, timestamp_ms};
use super::{
    ApiKeys, Balance, EarnPosition, Exchange, ExchangeError, LotRules, OrderAck, SpotOrder, Venue,
    flex_decimal,
};

const RECV_WINDOW: &str = "5000";

pub struct Binance {
    http: reqwest::Client,
    keys: ApiKeys,
    base: String,
}

impl Binance {
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

    /// Builds `path?params&timestamp&recvWindow&signature`.
    fn signed_url(&self, path: &str, mut params: Vec<(&str, String)>) -> String {
        params.push(("recvWindow", RECV_WINDOW.into()));
        params.push(("timestamp", timestamp_ms().to_string()));
        let qs = query_string(&params);
        let signature = hmac_sha256_hex(&self.keys.api_secret, &qs);
        format!("{}{path}?{qs}&signature={signature}", self.base)
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        let url = self.signed_url(path, params);
        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.keys.api_key)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        read(resp).await
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{path}?{}", self.base, query_string(params));
        let resp = self
            .http
            .get(&url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        read(resp).await
    }
}

/// Binance reports failures as `{"code": -2010, "msg": "..."}` with a 4xx status.
async fn read<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ExchangeError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        let err: Option<ApiErrorBody> = serde_json::from_str(&body).ok();
        return Err(match err {
            Some(e) => ExchangeError::Api {
                venue: Venue::Binance,
                code: e.code,
                message: e.msg,
            },
            None => ExchangeError::Api {
                venue: Venue::Binance,
                code: i64::from(status.as_u16()),
                message: body,
            },
        });
    }
    Ok(serde_json::from_str(&body)?)
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Deserialize)]
struct Account {
    balances: Vec<RawBalance>,
}

#[derive(Deserialize)]
struct RawBalance {
    asset: String,
    #[serde(deserialize_with = "flex_decimal")]
    free: Decimal,
    #[serde(deserialize_with = "flex_decimal")]
    locked: Decimal,
}

#[derive(Deserialize)]
struct TickerPrice {
    #[serde(deserialize_with = "flex_decimal")]
    price: Decimal,
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    filters: Vec<Filter>,
}

#[derive(Deserialize)]
#[serde(tag = "filterType")]
enum Filter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(deserialize_with = "flex_decimal")]
        min_qty: Decimal,
        #[serde(deserialize_with = "flex_decimal")]
        max_qty: Decimal,
        #[serde(deserialize_with = "flex_decimal")]
        step_size: Decimal,
    },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional {
        #[serde(deserialize_with = "flex_decimal")]
        min_notional: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional {
        #[serde(deserialize_with = "flex_decimal")]
        min_notional: Decimal,
    },
    #[serde(other)]
    Other,
}

fn rules_from_filters(filters: Vec<Filter>) -> LotRules {
    let mut rules = LotRules {
        step: Decimal::ZERO,
        min_qty: Decimal::ZERO,
        max_qty: None,
        min_notional: Decimal::ZERO,
    };
    for f in filters {
        match f {
            Filter::LotSize {
                min_qty,
                max_qty,
                step_size,
            } => {
                rules.step = step_size;
                rules.min_qty = min_qty;
                rules.max_qty = (max_qty > Decimal::ZERO).then_some(max_qty);
            }
            Filter::Notional { min_notional } | Filter::MinNotional { min_notional } => {
                rules.min_notional = rules.min_notional.max(min_notional);
            }
            Filter::Other => {}
        }
    }
    rules
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    #[serde(default, deserialize_with = "flex_decimal")]
    executed_qty: Decimal,
}

#[derive(Deserialize)]
struct EarnPage {
    #[serde(default)]
    rows: Vec<EarnRow>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EarnRow {
    asset: String,
    product_id: String,
    #[serde(deserialize_with = "flex_decimal")]
    total_amount: Decimal,
}

#[derive(Deserialize)]
struct RedeemResponse {
    #[serde(default)]
    success: bool,
}

#[async_trait]
impl Exchange for Binance {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    async fn spot_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let account: Account = self
            .signed(
                Method::GET,
                "/api/v3/account",
                vec![("omitZeroBalances", "true".into())],
            )
            .await?;
        Ok(account
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
        let ticker: TickerPrice = self
            .public("/api/v3/ticker/price", &[("symbol", symbol)])
            .await?;
        Ok(ticker.price)
    }

    async fn spot_rules(&self, asset: &str, quote: &str) -> Result<LotRules, ExchangeError> {
        let symbol = Self::symbol(asset, quote);
        let info: ExchangeInfo = self
            .public("/api/v3/exchangeInfo", &[("symbol", symbol.clone())])
            .await?;
        let sym = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or(ExchangeError::UnknownSymbol(symbol))?;
        Ok(rules_from_filters(sym.filters))
    }

    async fn place_spot_market(&self, order: &SpotOrder) -> Result<OrderAck, ExchangeError> {
        let params = vec![
            ("symbol", Self::symbol(&order.asset, &order.quote)),
            ("side", order.side.as_upper().into()),
            ("type", "MARKET".into()),
            ("quantity", order.quantity.normalize().to_string()),
        ];
        let resp: OrderResponse = self.signed(Method::POST, "/api/v3/order", params).await?;
        Ok(OrderAck {
            order_id: resp.order_id.to_string(),
            filled_qty: Some(resp.executed_qty),
        })
    }

    async fn earn_positions(&self) -> Result<Vec<EarnPosition>, ExchangeError> {
        let page: EarnPage = self
            .signed(
                Method::GET,
                "/sapi/v1/simple-earn/flexible/position",
                vec![("size", "100".into())],
            )
            .await?;
        Ok(page
            .rows
            .into_iter()
            .filter(|r| !r.total_amount.is_zero())
            .map(|r| EarnPosition {
                asset: r.asset,
                product_id: r.product_id,
                amount: r.total_amount,
            })
            .collect())
    }

    async fn redeem_earn(
        &self,
        position: &EarnPosition,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        let mut params = vec![("productId", position.product_id.clone())];
        if amount >= position.amount {
            params.push(("redeemAll", "true".into()));
        } else {
            params.push(("amount", amount.normalize().to_string()));
        }
        let resp: RedeemResponse = self
            .signed(Method::POST, "/sapi/v1/simple-earn/flexible/redeem", params)
            .await?;
        if !resp.success {
            return Err(ExchangeError::Api {
                venue: Venue::Binance,
                code: 0,
                message: format!("redemption of {} not accepted", position.asset),
            });
        }
        Ok(())
    }
}
