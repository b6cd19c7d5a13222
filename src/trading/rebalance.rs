//! Allocation math. Everything here is pure: the executor feeds it live
//! balances and prices and turns the resulting plan into exchange calls.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use serde::Serialize;

use crate::exchange::{Balance, EarnPosition, FuturesPosition, OrderSide, PositionSide};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("no price available for {0}")]
    UnknownPrice(String),
    #[error("percent must be within (0, 100], got {0}")]
    InvalidPercent(Decimal),
    #[error("leverage must be at least 1, got {0}")]
    InvalidLeverage(u32),
    #[error("asset is required")]
    MissingAsset,
    #[error("{0}")]
    NothingToDo(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Holdings {
    pub free: Decimal,
    pub locked: Decimal,
    pub earn: Decimal,
}

impl Holdings {
    pub fn total(&self) -> Decimal {
        self.free + self.locked + self.earn
    }
}

/// Spot + earn holdings of one account, with whatever prices are known.
#[derive(Clone, Debug)]
pub struct SpotSnapshot {
    pub quote: String,
    holdings: BTreeMap<String, Holdings>,
    prices: HashMap<String, Decimal>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Valuation {
    pub total: Decimal,
    pub unpriced: Vec<String>,
}

impl SpotSnapshot {
    pub fn new(quote: &str, balances: &[Balance], earn: &[EarnPosition]) -> Self {
        let mut holdings: BTreeMap<String, Holdings> = BTreeMap::new();
        for b in balances {
            let h = holdings.entry(b.asset.to_uppercase()).or_default();
            h.free += b.free;
            h.locked += b.locked;
        }
        for e in earn {
            holdings.entry(e.asset.to_uppercase()).or_default().earn += e.amount;
        }
        Self {
            quote: quote.to_uppercase(),
            holdings,
            prices: HashMap::new(),
        }
    }

    pub fn set_price(&mut self, asset: &str, price: Decimal) {
        self.prices.insert(asset.to_uppercase(), price);
    }

    /// Assets other than the quote that are held in any wallet.
    pub fn non_quote_assets(&self) -> Vec<String> {
        self.holdings
            .iter()
            .filter(|(a, h)| **a != self.quote && !h.total().is_zero())
            .map(|(a, _)| a.clone())
            .collect()
    }

    pub fn holdings(&self, asset: &str) -> Holdings {
        self.holdings
            .get(&asset.to_uppercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Holdings)> {
        self.holdings.iter()
    }

    pub fn price(&self, asset: &str) -> Option<Decimal> {
        let asset = asset.to_uppercase();
        if asset == self.quote {
            return Some(Decimal::ONE);
        }
        self.prices.get(&asset).copied()
    }

    /// Sum of priced holdings in the quote asset. Unpriced assets are left out.
    pub fn valuation(&self) -> Valuation {
        let mut total = Decimal::ZERO;
        let mut unpriced = Vec::new();
        for (asset, h) in &self.holdings {
            if h.total().is_zero() {
                continue;
            }
            match self.price(asset) {
                Some(p) => total += h.total() * p,
                None => unpriced.push(asset.clone()),
            }
        }
        Valuation { total, unpriced }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BuyPlan {
    pub asset: String,
    pub price: Decimal,
    pub portfolio_value: Decimal,
    pub target_value: Decimal,
    pub current_value: Decimal,
    /// Quote amount to spend, already capped at what is free or redeemable.
    pub spend: Decimal,
    /// Quote to pull out of earn before buying.
    pub redeem_quote: Decimal,
    /// Held assets left out of `portfolio_value` for lack of a price.
    pub unpriced: Vec<String>,
}

pub(crate) fn check_percent(percent: Decimal) -> Result<(), PlanError> {
    if percent <= Decimal::ZERO || percent > HUNDRED {
        return Err(PlanError::InvalidPercent(percent));
    }
    Ok(())
}

pub(crate) fn check_leverage(leverage: u32) -> Result<(), PlanError> {
    if leverage == 0 {
        return Err(PlanError::InvalidLeverage(leverage));
    }
    Ok(())
}

/// Buys `asset` up to `percent`% of the account value. Never sells.
pub fn plan_buy_to_target(
    snap: &SpotSnapshot,
    asset: &str,
    percent: Decimal,
) -> Result<BuyPlan, PlanError> {
    check_percent(percent)?;
    let asset = asset.to_uppercase();
    if asset == snap.quote {
        return Err(PlanError::NothingToDo(format!(
            "{asset} is the quote asset"
        )));
    }
    let price = snap
        .price(&asset)
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| PlanError::UnknownPrice(asset.clone()))?;

    let Valuation {
        total: portfolio_value,
        unpriced,
    } = snap.valuation();
    let target_value = portfolio_value * percent / HUNDRED;
    let current_value = snap.holdings(&asset).total() * price;
    let wanted = target_value - current_value;
    if wanted <= Decimal::ZERO {
        return Err(PlanError::NothingToDo(format!(
            "{asset} holds {} of target {}",
            current_value.round_dp(2),
            target_value.round_dp(2)
        )));
    }

    let quote = snap.holdings(&snap.quote);
    let shortfall = (wanted - quote.free).max(Decimal::ZERO);
    let redeem_quote = shortfall.min(quote.earn);
    let spend = wanted.min(quote.free + redeem_quote);
    if spend <= Decimal::ZERO {
        return Err(PlanError::NothingToDo(format!(
            "no free or redeemable {}",
            snap.quote
        )));
    }

    Ok(BuyPlan {
        asset,
        price,
        portfolio_value,
        target_value,
        current_value,
        spend,
        redeem_quote,
        unpriced,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SellPlan {
    pub asset: String,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Part of `quantity` that sits in earn and must be redeemed first.
    pub redeem: Decimal,
}

/// Sells every free and staked unit of `asset` into the quote asset.
pub fn plan_sell_all(snap: &SpotSnapshot, asset: &str) -> Result<SellPlan, PlanError> {
    let asset = asset.to_uppercase();
    if asset == snap.quote {
        return Err(PlanError::NothingToDo(format!(
            "{asset} is the quote asset"
        )));
    }
    let h = snap.holdings(&asset);
    let quantity = h.free + h.earn;
    if quantity.is_zero() {
        return Err(PlanError::NothingToDo(format!("no {asset} to sell")));
    }
    let price = snap
        .price(&asset)
        .ok_or_else(|| PlanError::UnknownPrice(asset.clone()))?;
    Ok(SellPlan {
        asset,
        price,
        quantity,
        redeem: h.earn,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FuturesOpenPlan {
    pub margin: Decimal,
    pub notional: Decimal,
    pub quantity: Decimal,
}

/// Commits `percent`% of available margin at `leverage`.
pub fn plan_futures_open(
    available: Decimal,
    price: Decimal,
    percent: Decimal,
    leverage: u32,
) -> Result<FuturesOpenPlan, PlanError> {
    check_percent(percent)?;
    check_leverage(leverage)?;
    if price <= Decimal::ZERO {
        return Err(PlanError::NothingToDo("non-positive price".into()));
    }
    let margin = available.max(Decimal::ZERO) * percent / HUNDRED;
    if margin.is_zero() {
        return Err(PlanError::NothingToDo("no available margin".into()));
    }
    let notional = margin * Decimal::from(leverage);
    Ok(FuturesOpenPlan {
        margin,
        notional,
        quantity: notional / price,
    })
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FuturesClosePlan {
    pub position_side: PositionSide,
    pub side: OrderSide,
    pub quantity: Decimal,
}

/// `BTC-USDT`, `btc/usdt` and `BTCUSDT` all compare equal.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// One reduce-only order per open position on `symbol` (hedge mode can hold both sides).
pub fn plan_futures_close(
    positions: &[FuturesPosition],
    symbol: &str,
) -> Result<Vec<FuturesClosePlan>, PlanError> {
    let wanted = normalize_symbol(symbol);
    let plans: Vec<_> = positions
        .iter()
        .filter(|p| normalize_symbol(&p.symbol) == wanted && !p.size.is_zero())
        .map(|p| FuturesClosePlan {
            position_side: p.side,
            side: p.side.closing_side(),
            quantity: p.size.abs(),
        })
        .collect();
    if plans.is_empty() {
        return Err(PlanError::NothingToDo(format!("no open position on {symbol}")));
    }
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bal(asset: &str, free: Decimal) -> Balance {
        Balance {
            asset: asset.into(),
            free,
            locked: Decimal::ZERO,
        }
    }

    fn earn(asset: &str, amount: Decimal) -> EarnPosition {
        EarnPosition {
            asset: asset.into(),
            product_id: format!("{asset}001"),
            amount,
        }
    }

    fn snapshot() -> SpotSnapshot {
        // 1000 USDT free + 1000 USDT staked + 0.01 BTC @ 50k (500) = 2500
        let mut s = SpotSnapshot::new(
            "USDT",
            &[bal("USDT", dec!(1000)), bal("BTC", dec!(0.01))],
            &[earn("USDT", dec!(1000))],
        );
        s.set_price("BTC", dec!(50000));
        s
    }

    #[test]
    fn valuation_counts_earn_and_skips_unpriced() {
        let mut s = SpotSnapshot::new(
            "USDT",
            &[bal("USDT", dec!(1000)), bal("BTC", dec!(0.01)), bal("DUST", dec!(3))],
            &[earn("USDT", dec!(1000))],
        );
        s.set_price("BTC", dec!(50000));
        let v = s.valuation();
        assert_eq!(v.total, dec!(2500));
        assert_eq!(v.unpriced, vec!["DUST".to_string()]);
    }

    #[test]
    fn buy_to_target_from_free_quote() {
        // target 40% of 2500 = 1000, holds 500 → spend 500, free covers it
        let plan = plan_buy_to_target(&snapshot(), "btc", dec!(40)).unwrap();
        assert_eq!(plan.spend, dec!(500));
        assert_eq!(plan.redeem_quote, Decimal::ZERO);
        assert_eq!(plan.target_value, dec!(1000));
    }

    #[test]
    fn buy_to_target_redeems_the_shortfall() {
        // target 80% of 2500 = 2000, holds 500 → wants 1500, free 1000 → redeem 500
        let plan = plan_buy_to_target(&snapshot(), "BTC", dec!(80)).unwrap();
        assert_eq!(plan.spend, dec!(1500));
        assert_eq!(plan.redeem_quote, dec!(500));
    }

    #[test]
    fn buy_to_target_is_capped_by_redeemable_funds() {
        // 100% target wants 2000 but only 1000 free + 1000 staked
        let plan = plan_buy_to_target(&snapshot(), "BTC", dec!(100)).unwrap();
        assert_eq!(plan.spend, dec!(2000));
        assert_eq!(plan.redeem_quote, dec!(1000));

        let mut s = SpotSnapshot::new("USDT", &[bal("USDT", dec!(100))], &[]);
        s.set_price("ETH", dec!(2000));
        let plan = plan_buy_to_target(&s, "ETH", dec!(100)).unwrap();
        assert_eq!(plan.spend, dec!(100));
    }

    #[test]
    fn buy_to_target_never_sells() {
        let err = plan_buy_to_target(&snapshot(), "BTC", dec!(10)).unwrap_err();
        assert!(matches!(err, PlanError::NothingToDo(_)));
    }

    #[test]
    fn buy_requires_price_and_sane_percent() {
        assert_eq!(
            plan_buy_to_target(&snapshot(), "ETH", dec!(10)),
            Err(PlanError::UnknownPrice("ETH".into()))
        );
        assert_eq!(
            plan_buy_to_target(&snapshot(), "BTC", dec!(0)),
            Err(PlanError::InvalidPercent(dec!(0)))
        );
        assert_eq!(
            plan_buy_to_target(&snapshot(), "BTC", dec!(150)),
            Err(PlanError::InvalidPercent(dec!(150)))
        );
    }

    #[test]
    fn sell_all_includes_staked_units() {
        let mut s = SpotSnapshot::new(
            "USDT",
            &[bal("ETH", dec!(1.5))],
            &[earn("ETH", dec!(0.5))],
        );
        s.set_price("ETH", dec!(2000));
        let plan = plan_sell_all(&s, "eth").unwrap();
        assert_eq!(plan.quantity, dec!(2));
        assert_eq!(plan.redeem, dec!(0.5));
    }

    #[test]
    fn sell_all_with_nothing_held() {
        let s = SpotSnapshot::new("USDT", &[bal("USDT", dec!(10))], &[]);
        assert!(matches!(
            plan_sell_all(&s, "SOL"),
            Err(PlanError::NothingToDo(_))
        ));
    }

    #[test]
    fn futures_open_sizes_by_margin_and_leverage() {
        let plan = plan_futures_open(dec!(1000), dec!(50000), dec!(25), 4).unwrap();
        assert_eq!(plan.margin, dec!(250));
        assert_eq!(plan.notional, dec!(1000));
        assert_eq!(plan.quantity, dec!(0.02));
        assert_eq!(
            plan_futures_open(dec!(1000), dec!(50000), dec!(25), 0),
            Err(PlanError::InvalidLeverage(0))
        );
    }

    #[test]
    fn futures_close_flattens_each_side() {
        let pos = |side, size| FuturesPosition {
            symbol: "BTC-USDT".into(),
            side,
            size,
            entry_price: dec!(60000),
            mark_price: dec!(60000),
            unrealized_pnl: Decimal::ZERO,
            leverage: dec!(5),
        };
        let plans = plan_futures_close(
            &[pos(PositionSide::Long, dec!(0.1)), pos(PositionSide::Short, dec!(0.05))],
            "BTCUSDT",
        )
        .unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].side, OrderSide::Sell);
        assert_eq!(plans[1].side, OrderSide::Buy);
        assert_eq!(plans[1].quantity, dec!(0.05));
        assert!(plan_futures_close(&[], "BTCUSDT").is_err());
    }
}
