use rust_decimal::Decimal;
use serde::Serialize;

use super::rebalance::SpotSnapshot;
use crate::exchange::{Exchange, ExchangeError, FuturesAccount, Venue};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AssetLine {
    pub asset: String,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub value: Option<Decimal>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PortfolioSummary {
    pub venue: Venue,
    pub quote: String,
    pub spot: Vec<AssetLine>,
    pub spot_value: Decimal,
    pub earn: Vec<AssetLine>,
    pub earn_value: Decimal,
    pub futures: Option<FuturesAccount>,
    pub futures_equity: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_value: Decimal,
    /// False when a wallet read failed, so `total_value` undercounts.
    pub complete: bool,
    pub warnings: Vec<String>,
}

/// Profit against the configured baseline and the previous snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Pnl {
    pub invested: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub pnl_percent: Option<Decimal>,
    pub previous_value: Option<Decimal>,
    pub change: Option<Decimal>,
}

pub fn pnl(total: Decimal, invested: Option<Decimal>, previous: Option<Decimal>) -> Pnl {
    let pnl = invested.map(|i| total - i);
    let pnl_percent = match (pnl, invested) {
        (Some(p), Some(i)) if !i.is_zero() => Some((p / i * Decimal::ONE_HUNDRED).round_dp(2)),
        _ => None,
    };
    Pnl {
        invested,
        pnl,
        pnl_percent,
        previous_value: previous,
        change: previous.map(|p| total - p),
    }
}

/// `Unsupported` wallets count as empty; other failures become warnings and
/// clear `complete`.
fn soften<T>(
    result: Result<T, ExchangeError>,
    wallet: &str,
    warnings: &mut Vec<String>,
    complete: &mut bool,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) if e.is_unsupported() => None,
        Err(e) => {
            tracing::warn!("{wallet} wallet read failed: {e}");
            warnings.push(format!("{wallet}: {e}"));
            *complete = false;
            None
        }
    }
}

/// Reads spot, earn and futures wallets concurrently and values them in `quote`.
pub async fn summarize(ex: &dyn Exchange, quote: &str) -> PortfolioSummary {
    let quote = quote.to_uppercase();
    let mut warnings = Vec::new();
    let mut complete = true;

    let (spot, earn, futures) = tokio::join!(
        ex.spot_balances(),
        ex.earn_positions(),
        ex.futures_account(&quote)
    );
    let spot = soften(spot, "spot", &mut warnings, &mut complete).unwrap_or_default();
    let earn = soften(earn, "earn", &mut warnings, &mut complete).unwrap_or_default();
    let futures = soften(futures, "futures", &mut warnings, &mut complete);

    let mut snap = SpotSnapshot::new(&quote, &spot, &earn);
    for asset in snap.non_quote_assets() {
        match ex.spot_price(&asset, &quote).await {
            Ok(p) => snap.set_price(&asset, p),
            Err(e) => {
                tracing::debug!("no {asset}/{quote} price on {}: {e}", ex.venue());
                warnings.push(format!("{asset} unpriced"));
            }
        }
    }

    let mut spot_lines = Vec::new();
    let mut earn_lines = Vec::new();
    let mut spot_value = Decimal::ZERO;
    let mut earn_value = Decimal::ZERO;
    for (asset, h) in snap.iter() {
        let price = snap.price(asset);
        let spot_amount = h.free + h.locked;
        if !spot_amount.is_zero() {
            let value = price.map(|p| spot_amount * p);
            spot_value += value.unwrap_or_default();
            spot_lines.push(AssetLine {
                asset: asset.clone(),
                amount: spot_amount,
                price,
                value,
            });
        }
        if !h.earn.is_zero() {
            let value = price.map(|p| h.earn * p);
            earn_value += value.unwrap_or_default();
            earn_lines.push(AssetLine {
                asset: asset.clone(),
                amount: h.earn,
                price,
                value,
            });
        }
    }

    let unrealized_pnl = futures.as_ref().map(|f| f.unrealized_pnl).unwrap_or_default();
    let futures_equity = futures.as_ref().map(|f| f.equity()).unwrap_or_default();
    // A unified wallet already holds the futures margin among its spot coins.
    let futures_contribution = if ex.unified_margin() {
        unrealized_pnl
    } else {
        futures_equity
    };

    PortfolioSummary {
        venue: ex.venue(),
        quote,
        spot: spot_lines,
        spot_value,
        earn: earn_lines,
        earn_value,
        futures,
        futures_equity,
        unrealized_pnl,
        total_value: spot_value + earn_value + futures_contribution,
        complete,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FuturesPosition, PositionSide};
    use crate::trading::testkit::{FakeExchange, State, balance, staked};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn totals_spot_earn_and_futures() {
        let fake = FakeExchange::new(State {
            balances: vec![balance("USDT", dec!(100)), balance("BTC", dec!(0.01))],
            earn: Some(vec![staked("USDT", dec!(50)), staked("BTC", dec!(0.001))]),
            prices: [("BTC".to_string(), dec!(60000))].into_iter().collect(),
            futures: Some(FuturesAccount {
                wallet_balance: dec!(200),
                available: dec!(150),
                unrealized_pnl: dec!(-20),
                positions: vec![FuturesPosition {
                    symbol: "ETHUSDT".into(),
                    side: PositionSide::Long,
                    size: dec!(1),
                    entry_price: dec!(3000),
                    mark_price: dec!(2980),
                    unrealized_pnl: dec!(-20),
                    leverage: dec!(10),
                }],
            }),
            ..Default::default()
        });
        let s = summarize(&fake, "usdt").await;

        assert_eq!(s.spot_value, dec!(700));
        assert_eq!(s.earn_value, dec!(110));
        assert_eq!(s.futures_equity, dec!(180));
        assert_eq!(s.total_value, dec!(990));
        assert!(s.complete);
        assert!(s.warnings.is_empty());
    }

    #[tokio::test]
    async fn unsupported_wallets_are_silent_and_unpriced_assets_warn() {
        let fake = FakeExchange::new(State {
            balances: vec![balance("USDT", dec!(10)), balance("XYZ", dec!(5))],
            earn: None,
            futures: None,
            ..Default::default()
        });
        let s = summarize(&fake, "USDT").await;

        assert_eq!(s.total_value, dec!(10));
        assert!(s.complete, "unsupported wallets and unpriced coins are not read failures");
        assert!(s.futures.is_none());
        assert_eq!(s.warnings, vec!["XYZ unpriced".to_string()]);
        let xyz = s.spot.iter().find(|l| l.asset == "XYZ").unwrap();
        assert_eq!(xyz.value, None);
    }

    #[tokio::test]
    async fn failed_wallet_read_marks_summary_incomplete() {
        let fake = FakeExchange::new(State {
            balances: vec![balance("USDT", dec!(10))],
            earn: Some(vec![staked("USDT", dec!(500))]),
            fail_earn_reads: true,
            ..Default::default()
        });
        let s = summarize(&fake, "USDT").await;

        assert!(!s.complete);
        assert_eq!(s.total_value, dec!(10));
        assert_eq!(s.warnings.len(), 1);
        assert!(s.warnings[0].starts_with("earn: "));
    }

    #[test]
    fn pnl_against_baseline_and_previous() {
        let p = pnl(dec!(1200), Some(dec!(1000)), Some(dec!(1100)));
        assert_eq!(p.pnl, Some(dec!(200)));
        assert_eq!(p.pnl_percent, Some(dec!(20)));
        assert_eq!(p.change, Some(dec!(100)));

        let p = pnl(dec!(1200), None, None);
        assert_eq!(p, Pnl::default());
    }
}
