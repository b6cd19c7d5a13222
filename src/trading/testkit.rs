//! In-memory [`Exchange`] used by executor and portfolio tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::exchange::{
    Balance, EarnPosition, Exchange, ExchangeError, FuturesAccount, FuturesOrder, LotRules,
    OrderAck, SpotOrder, Venue,
};

#[derive(Default)]
pub struct State {
    pub balances: Vec<Balance>,
    /// `None` means the venue has no earn product.
    pub earn: Option<Vec<EarnPosition>>,
    pub prices: HashMap<String, Decimal>,
    pub futures: Option<FuturesAccount>,
    pub leverage: Option<u32>,
    pub spot_orders: Vec<SpotOrder>,
    pub futures_orders: Vec<FuturesOrder>,
    pub redemptions: Vec<(String, Decimal)>,
    pub fail_orders: bool,
    /// Earn reads answer with a transport-style API error.
    pub fail_earn_reads: bool,
}

pub struct FakeExchange {
    pub state: Mutex<State>,
    pub rules: LotRules,
}

impl FakeExchange {
    pub fn new(state: State) -> Self {
        Self {
            state: Mutex::new(state),
            rules: LotRules {
                step: Decimal::new(1, 5),
                min_qty: Decimal::new(1, 5),
                max_qty: None,
                min_notional: Decimal::from(5),
            },
        }
    }

    pub fn with_rules(mut self, rules: LotRules) -> Self {
        self.rules = rules;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

pub fn balance(asset: &str, free: Decimal) -> Balance {
    Balance {
        asset: asset.into(),
        free,
        locked: Decimal::ZERO,
    }
}

pub fn staked(asset: &str, amount: Decimal) -> EarnPosition {
    EarnPosition {
        asset: asset.into(),
        product_id: format!("{asset}-flex"),
        amount,
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    async fn spot_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        Ok(self.lock().balances.clone())
    }

    async fn spot_price(&self, asset: &str, _quote: &str) -> Result<Decimal, ExchangeError> {
        self.lock()
            .prices
            .get(asset)
            .copied()
            .ok_or_else(|| ExchangeError::UnknownSymbol(asset.to_string()))
    }

    async fn spot_rules(&self, _asset: &str, _quote: &str) -> Result<LotRules, ExchangeError> {
        Ok(self.rules.clone())
    }

    async fn place_spot_market(&self, order: &SpotOrder) -> Result<OrderAck, ExchangeError> {
        let mut st = self.lock();
        if st.fail_orders {
            return Err(ExchangeError::Api {
                venue: Venue::Binance,
                code: -2010,
                message: "Account has insufficient balance for requested action.".into(),
            });
        }
        st.spot_orders.push(order.clone());
        Ok(OrderAck {
            order_id: format!("spot-{}", st.spot_orders.len()),
            filled_qty: Some(order.quantity),
        })
    }

    async fn earn_positions(&self) -> Result<Vec<EarnPosition>, ExchangeError> {
        let st = self.lock();
        if st.fail_earn_reads {
            return Err(ExchangeError::Api {
                venue: Venue::Binance,
                code: -1001,
                message: "Internal error; unable to process your request.".into(),
            });
        }
        st.earn.clone().ok_or_else(|| self.unsupported("earn wallets"))
    }

    async fn redeem_earn(
        &self,
        position: &EarnPosition,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        let mut st = self.lock();
        let Some(earn) = st.earn.as_mut() else {
            return Err(self.unsupported("earn redemption"));
        };
        let amount = match earn.iter_mut().find(|p| p.product_id == position.product_id) {
            Some(p) => {
                let taken = amount.min(p.amount);
                p.amount -= taken;
                taken
            }
            None => return Err(ExchangeError::UnknownSymbol(position.product_id.clone())),
        };
        match st.balances.iter_mut().find(|b| b.asset == position.asset) {
            Some(b) => b.free += amount,
            None => st.balances.push(balance(&position.asset, amount)),
        }
        st.redemptions.push((position.asset.clone(), amount));
        Ok(())
    }

    async fn futures_account(&self, _quote: &str) -> Result<FuturesAccount, ExchangeError> {
        self.lock()
            .futures
            .clone()
            .ok_or_else(|| self.unsupported("futures"))
    }

    async fn futures_price(&self, asset: &str, quote: &str) -> Result<Decimal, ExchangeError> {
        self.spot_price(asset, quote).await
    }

    async fn futures_rules(&self, _asset: &str, _quote: &str) -> Result<LotRules, ExchangeError> {
        Ok(self.rules.clone())
    }

    async fn set_leverage(&self, _asset: &str, _quote: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.lock().leverage = Some(leverage);
        Ok(())
    }

    async fn place_futures_market(&self, order: &FuturesOrder) -> Result<OrderAck, ExchangeError> {
        let mut st = self.lock();
        st.futures_orders.push(order.clone());
        Ok(OrderAck {
            order_id: format!("fut-{}", st.futures_orders.len()),
            filled_qty: None,
        })
    }
}
