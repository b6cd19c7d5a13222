//! Rebalance-and-execute: read live balances, plan, top up from earn when the
//! free balance is short, quantize to the venue's lot rules, submit a market order.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::quantize::{QuantizeError, quantize};
use super::rebalance::{
    BuyPlan, PlanError, SpotSnapshot, check_leverage, check_percent, plan_buy_to_target, plan_futures_close, plan_futures_open,
    plan_sell_all,
};
use crate::exchange::{
    EarnPosition, Exchange, ExchangeError, FuturesOrder, OrderSide, PositionSide, SpotOrder, Venue,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TradeAction {
    BuyToTarget {
        asset: String,
        percent: Decimal,
    },
    SellAll {
        asset: String,
    },
    OpenFutures {
        asset: String,
        side: PositionSide,
        percent: Decimal,
        #[serde(default = "default_leverage")]
        leverage: u32,
    },
    CloseFutures {
        asset: String,
    },
}

fn default_leverage() -> u32 {
    1
}

impl TradeAction {
    pub fn asset(&self) -> &str {
        match self {
            Self::BuyToTarget { asset, .. }
            | Self::SellAll { asset }
            | Self::OpenFutures { asset, .. }
            | Self::CloseFutures { asset } => asset,
        }
    }

    /// Rejects malformed actions before any exchange is touched.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.asset().trim().is_empty() {
            return Err(PlanError::MissingAsset);
        }
        match self {
            Self::BuyToTarget { percent, .. } => check_percent(*percent),
            Self::OpenFutures {
                percent, leverage, ..
            } => {
                check_percent(*percent)?;
                check_leverage(*leverage)
            }
            Self::SellAll { .. } | Self::CloseFutures { .. } => Ok(()),
        }
    }

    /// Uppercases the asset so every venue sees the same symbol.
    pub fn normalized(mut self) -> Self {
        match &mut self {
            Self::BuyToTarget { asset, .. }
            | Self::SellAll { asset }
            | Self::OpenFutures { asset, .. }
            | Self::CloseFutures { asset } => *asset = asset.trim().to_uppercase(),
        }
        self
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub quote: String,
    /// Fraction held back from buy sizes for fees and slippage.
    pub fee_buffer: Decimal,
    /// Wait after an earn redemption before the funds are spendable.
    pub redeem_settle: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Filled,
    Skipped,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filled => "filled",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionReport {
    pub credential_id: String,
    pub label: String,
    pub venue: Venue,
    pub action: TradeAction,
    pub status: ExecutionStatus,
    pub order_ids: Vec<String>,
    pub quantity: Option<Decimal>,
    pub quote_amount: Option<Decimal>,
    pub redeemed: Option<Decimal>,
    pub detail: Option<String>,
}

/// An exchange client bound to a stored credential set.
pub struct Account {
    pub credential_id: String,
    pub label: String,
    pub exchange: Arc<dyn Exchange>,
}

#[derive(Debug, thiserror::Error)]
enum ExecError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Quantize(#[from] QuantizeError),
}

impl ExecError {
    fn status(&self) -> ExecutionStatus {
        match self {
            Self::Plan(PlanError::NothingToDo(_)) | Self::Quantize(_) => ExecutionStatus::Skipped,
            _ => ExecutionStatus::Failed,
        }
    }
}

/// Filled in as side effects happen, so a failure late in a flow still
/// reports the redemptions and orders that went through before it.
#[derive(Default)]
struct Outcome {
    order_ids: Vec<String>,
    quantity: Option<Decimal>,
    quote_amount: Option<Decimal>,
    redeemed: Option<Decimal>,
    detail: Option<String>,
}

/// Runs one action against one account. Failures are folded into the report.
pub async fn execute(account: &Account, action: &TradeAction, cfg: &ExecutorConfig) -> ExecutionReport {
    let ex = account.exchange.as_ref();
    let label = account.label.as_str();
    let mut outcome = Outcome::default();
    let result = match action {
        TradeAction::BuyToTarget { asset, percent } => {
            buy_to_target(ex, label, asset, *percent, cfg, &mut outcome).await
        }
        TradeAction::SellAll { asset } => sell_all(ex, label, asset, cfg, &mut outcome).await,
        TradeAction::OpenFutures {
            asset,
            side,
            percent,
            leverage,
        } => {
            open_futures(ex, label, asset, *side, *percent, *leverage, cfg, &mut outcome).await
        }
        TradeAction::CloseFutures { asset } => {
            close_futures(ex, label, asset, cfg, &mut outcome).await
        }
    };

    let status = match result {
        Ok(()) => ExecutionStatus::Filled,
        Err(e) => {
            let status = e.status();
            match status {
                ExecutionStatus::Skipped => {
                    tracing::info!("[{label}] {} {} skipped: {e}", ex.venue(), action.asset())
                }
                _ => tracing::warn!("[{label}] {} {} failed: {e}", ex.venue(), action.asset()),
            }
            if let Some(redeemed) = outcome.redeemed {
                tracing::warn!(
                    "[{label}] {} {redeemed} was already redeemed from earn and stays in spot",
                    ex.venue()
                );
            }
            outcome.detail = Some(e.to_string());
            status
        }
    };

    ExecutionReport {
        credential_id: account.credential_id.clone(),
        label: account.label.clone(),
        venue: ex.venue(),
        action: action.clone(),
        status,
        order_ids: outcome.order_ids,
        quantity: outcome.quantity,
        quote_amount: outcome.quote_amount,
        redeemed: outcome.redeemed,
        detail: outcome.detail,
    }
}

/// Runs `action` on every account, at most `max_parallel` at a time.
/// Reports come back in the same order as `accounts`.
pub async fn execute_all(
    accounts: Vec<Account>,
    action: TradeAction,
    cfg: ExecutorConfig,
    max_parallel: usize,
) -> Vec<ExecutionReport> {
    let sem = Arc::new(tokio::sync::Semaphore::new(max_parallel.max(1)));
    let action = Arc::new(action);
    let cfg = Arc::new(cfg);
    let mut handles = Vec::with_capacity(accounts.len());

    for account in accounts {
        let sem = Arc::clone(&sem);
        let action = Arc::clone(&action);
        let cfg = Arc::clone(&cfg);
        let ident = (account.credential_id.clone(), account.label.clone(), account.exchange.venue());
        handles.push((
            ident,
            tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                execute(&account, &action, &cfg).await
            }),
        ));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for ((credential_id, label, venue), handle) in handles {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(e) => {
                tracing::error!("[{label}] execution task aborted: {e}");
                reports.push(ExecutionReport {
                    credential_id,
                    label,
                    venue,
                    action: (*action).clone(),
                    status: ExecutionStatus::Failed,
                    order_ids: Vec::new(),
                    quantity: None,
                    quote_amount: None,
                    redeemed: None,
                    detail: Some(format!("task aborted: {e}")),
                });
            }
        }
    }
    reports
}

/// Earn positions, treating "no earn product on this venue" as empty.
async fn earn_or_empty(ex: &dyn Exchange) -> Result<Vec<EarnPosition>, ExchangeError> {
    match ex.earn_positions().await {
        Ok(p) => Ok(p),
        Err(e) if e.is_unsupported() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Redeems up to `amount` of `asset` across its earn products, adding each
/// completed redemption to `redeemed`.
async fn redeem(
    ex: &dyn Exchange,
    label: &str,
    positions: &[EarnPosition],
    asset: &str,
    amount: Decimal,
    redeemed: &mut Option<Decimal>,
) -> Result<(), ExchangeError> {
    let mut remaining = amount;
    for pos in positions.iter().filter(|p| p.asset.eq_ignore_ascii_case(asset)) {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = remaining.min(pos.amount);
        ex.redeem_earn(pos, take).await?;
        *redeemed = Some(redeemed.unwrap_or_default() + take);
        tracing::info!(
            "[{label}] {} redeemed {take} {asset} from earn product {}",
            ex.venue(),
            pos.product_id
        );
        remaining -= take;
    }
    Ok(())
}

async fn free_balance(ex: &dyn Exchange, asset: &str) -> Result<Decimal, ExchangeError> {
    Ok(ex
        .spot_balances()
        .await?
        .into_iter()
        .filter(|b| b.asset.eq_ignore_ascii_case(asset))
        .map(|b| b.free)
        .sum())
}

/// Builds a priced snapshot. `required` must be priceable; other assets are
/// best effort so one delisted coin can't block a rebalance.
async fn priced_snapshot(
    ex: &dyn Exchange,
    label: &str,
    quote: &str,
    required: &str,
) -> Result<(SpotSnapshot, Vec<EarnPosition>), ExecError> {
    let balances = ex.spot_balances().await?;
    let earn = earn_or_empty(ex).await?;
    let mut snap = SpotSnapshot::new(quote, &balances, &earn);

    let mut assets = snap.non_quote_assets();
    if !assets.iter().any(|a| a == required) && !required.eq_ignore_ascii_case(quote) {
        assets.push(required.to_string());
    }
    for asset in assets {
        match ex.spot_price(&asset, quote).await {
            Ok(p) => snap.set_price(&asset, p),
            Err(e) if asset == required => return Err(e.into()),
            Err(e) => tracing::debug!("[{label}] no {asset}/{quote} price, excluded from valuation: {e}"),
        }
    }
    Ok((snap, earn))
}

async fn buy_to_target(
    ex: &dyn Exchange,
    label: &str,
    asset: &str,
    percent: Decimal,
    cfg: &ExecutorConfig,
    out: &mut Outcome,
) -> Result<(), ExecError> {
    let quote = cfg.quote.as_str();
    let (snap, earn) = priced_snapshot(ex, label, quote, asset).await?;
    let plan = plan_buy_to_target(&snap, asset, percent)?;
    let rules = ex.spot_rules(asset, quote).await?;

    let min_value = rules.min_order_value(plan.price);
    if plan.spend < min_value {
        return Err(QuantizeError::BelowMinNotional {
            value: plan.spend,
            min: min_value,
        }
        .into());
    }

    let mut spend = plan.spend;
    if plan.redeem_quote > Decimal::ZERO {
        redeem(ex, label, &earn, quote, plan.redeem_quote, &mut out.redeemed).await?;
        tokio::time::sleep(cfg.redeem_settle).await;
        spend = spend.min(free_balance(ex, quote).await?);
    }

    let raw_qty = spend * (Decimal::ONE - cfg.fee_buffer) / plan.price;
    let qty = quantize(raw_qty, plan.price, &rules)?;
    let ack = ex
        .place_spot_market(&SpotOrder {
            asset: plan.asset.clone(),
            quote: quote.to_string(),
            side: OrderSide::Buy,
            quantity: qty,
        })
        .await?;
    let quote_amount = (qty * plan.price).round_dp(8);
    tracing::info!(
        "[{label}] {} bought {qty} {} for ~{quote_amount} {quote} (target {}%, order {})",
        ex.venue(),
        plan.asset,
        percent,
        ack.order_id
    );

    out.order_ids.push(ack.order_id);
    out.quantity = Some(ack.filled_qty.filter(|q| !q.is_zero()).unwrap_or(qty));
    out.quote_amount = Some(quote_amount);
    out.detail = Some(buy_detail(&plan, quote));
    Ok(())
}

fn buy_detail(plan: &BuyPlan, quote: &str) -> String {
    let mut detail = format!(
        "target {} of {} {quote}, held {}",
        plan.target_value.round_dp(2),
        plan.portfolio_value.round_dp(2),
        plan.current_value.round_dp(2)
    );
    if !plan.unpriced.is_empty() {
        detail.push_str(&format!(" (unpriced: {})", plan.unpriced.join(", ")));
    }
    detail
}

async fn sell_all(
    ex: &dyn Exchange,
    label: &str,
    asset: &str,
    cfg: &ExecutorConfig,
    out: &mut Outcome,
) -> Result<(), ExecError> {
    let quote = cfg.quote.as_str();
    let (snap, earn) = priced_snapshot(ex, label, quote, asset).await?;
    let plan = plan_sell_all(&snap, asset)?;
    let rules = ex.spot_rules(&plan.asset, quote).await?;

    let mut qty = plan.quantity;
    if plan.redeem > Decimal::ZERO {
        redeem(ex, label, &earn, &plan.asset, plan.redeem, &mut out.redeemed).await?;
        tokio::time::sleep(cfg.redeem_settle).await;
        qty = free_balance(ex, &plan.asset).await?;
    }

    let qty = quantize(qty, plan.price, &rules)?;
    let ack = ex
        .place_spot_market(&SpotOrder {
            asset: plan.asset.clone(),
            quote: quote.to_string(),
            side: OrderSide::Sell,
            quantity: qty,
        })
        .await?;
    let quote_amount = (qty * plan.price).round_dp(8);
    tracing::info!(
        "[{label}] {} sold {qty} {} for ~{quote_amount} {quote} (order {})",
        ex.venue(),
        plan.asset,
        ack.order_id
    );

    out.order_ids.push(ack.order_id);
    out.quantity = Some(qty);
    out.quote_amount = Some(quote_amount);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn open_futures(
    ex: &dyn Exchange,
    label: &str,
    asset: &str,
    side: PositionSide,
    percent: Decimal,
    leverage: u32,
    cfg: &ExecutorConfig,
    out: &mut Outcome,
) -> Result<(), ExecError> {
    let quote = cfg.quote.as_str();
    let account = ex.futures_account(quote).await?;
    let price = ex.futures_price(asset, quote).await?;
    let plan = plan_futures_open(account.available, price, percent, leverage)?;
    let rules = ex.futures_rules(asset, quote).await?;
    let qty = quantize(plan.quantity * (Decimal::ONE - cfg.fee_buffer), price, &rules)?;

    ex.set_leverage(asset, quote, leverage).await?;
    let ack = ex
        .place_futures_market(&FuturesOrder {
            asset: asset.to_string(),
            quote: quote.to_string(),
            side: side.opening_side(),
            position_side: side,
            quantity: qty,
            reduce_only: false,
        })
        .await?;
    tracing::info!(
        "[{label}] {} opened {side:?} {qty} {asset} at {leverage}x, margin {} {quote} (order {})",
        ex.venue(),
        plan.margin.round_dp(2),
        ack.order_id
    );

    out.order_ids.push(ack.order_id);
    out.quantity = Some(qty);
    out.quote_amount = Some((qty * price).round_dp(8));
    out.detail = Some(format!("margin {} at {leverage}x", plan.margin.round_dp(2)));
    Ok(())
}

async fn close_futures(
    ex: &dyn Exchange,
    label: &str,
    asset: &str,
    cfg: &ExecutorConfig,
    out: &mut Outcome,
) -> Result<(), ExecError> {
    let quote = cfg.quote.as_str();
    let account = ex.futures_account(quote).await?;
    let plans = plan_futures_close(&account.positions, &format!("{asset}{quote}"))?;

    for plan in plans {
        let ack = ex
            .place_futures_market(&FuturesOrder {
                asset: asset.to_string(),
                quote: quote.to_string(),
                side: plan.side,
                position_side: plan.position_side,
                quantity: plan.quantity,
                reduce_only: true,
            })
            .await?;
        tracing::info!(
            "[{label}] {} closed {:?} {} {asset} (order {})",
            ex.venue(),
            plan.position_side,
            plan.quantity,
            ack.order_id
        );
        out.order_ids.push(ack.order_id);
        out.quantity = Some(out.quantity.unwrap_or_default() + plan.quantity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FuturesAccount, FuturesPosition, LotRules};
    use crate::trading::testkit::{FakeExchange, State, balance, staked};
    use rust_decimal_macros::dec;

    fn cfg() -> ExecutorConfig {
        ExecutorConfig {
            quote: "USDT".into(),
            fee_buffer: dec!(0.002),
            redeem_settle: Duration::ZERO,
        }
    }

    fn account(state: State) -> (Account, Arc<FakeExchange>) {
        let fake = Arc::new(FakeExchange::new(state));
        (
            Account {
                credential_id: "cred-1".into(),
                label: "main".into(),
                exchange: fake.clone(),
            },
            fake,
        )
    }

    fn inspect<R>(fake: &FakeExchange, f: impl FnOnce(&State) -> R) -> R {
        f(&fake.state.lock().unwrap())
    }

    fn prices(pairs: &[(&str, Decimal)]) -> std::collections::HashMap<String, Decimal> {
        pairs.iter().map(|(a, p)| (a.to_string(), *p)).collect()
    }

    #[tokio::test]
    async fn buys_from_free_quote_without_redeeming() {
        let (acct, fake) = account(State {
            balances: vec![balance("USDT", dec!(1000)), balance("BTC", dec!(0.01))],
            earn: Some(vec![]),
            prices: prices(&[("BTC", dec!(50000))]),
            ..Default::default()
        });
        let action = TradeAction::BuyToTarget {
            asset: "BTC".into(),
            percent: dec!(50),
        };
        let report = execute(&acct, &action, &cfg()).await;

        assert_eq!(report.status, ExecutionStatus::Filled, "{:?}", report.detail);
        assert_eq!(report.redeemed, None);
        inspect(&fake, |st| {
            assert_eq!(st.spot_orders.len(), 1);
            // value 1500, target 750, held 500 → spend 250 * 0.998 / 50000
            assert_eq!(st.spot_orders[0].quantity, dec!(0.00499));
            assert_eq!(st.spot_orders[0].side, OrderSide::Buy);
        });
    }

    #[tokio::test]
    async fn redeems_staked_quote_when_free_is_short() {
        let (acct, fake) = account(State {
            balances: vec![balance("USDT", dec!(100))],
            earn: Some(vec![staked("USDT", dec!(900))]),
            prices: prices(&[("ETH", dec!(2000))]),
            ..Default::default()
        });
        let action = TradeAction::BuyToTarget {
            asset: "ETH".into(),
            percent: dec!(60),
        };
        let report = execute(&acct, &action, &cfg()).await;

        assert_eq!(report.status, ExecutionStatus::Filled, "{:?}", report.detail);
        // target 600, free 100 → redeem 500
        assert_eq!(report.redeemed, Some(dec!(500)));
        inspect(&fake, |st| {
            assert_eq!(st.redemptions, vec![("USDT".to_string(), dec!(500))]);
            assert_eq!(st.spot_orders[0].quantity, dec!(0.2994));
        });
    }

    #[tokio::test]
    async fn skips_orders_below_min_notional_before_redeeming() {
        let (acct, fake) = account(State {
            balances: vec![balance("USDT", dec!(2))],
            earn: Some(vec![staked("USDT", dec!(1))]),
            prices: prices(&[("BTC", dec!(50000))]),
            ..Default::default()
        });
        let action = TradeAction::BuyToTarget {
            asset: "BTC".into(),
            percent: dec!(100),
        };
        let report = execute(&acct, &action, &cfg()).await;

        assert_eq!(report.status, ExecutionStatus::Skipped);
        inspect(&fake, |st| {
            assert!(st.redemptions.is_empty());
            assert!(st.spot_orders.is_empty());
        });
    }

    #[tokio::test]
    async fn sell_all_redeems_then_sells_everything() {
        let (acct, fake) = account(State {
            balances: vec![balance("ETH", dec!(1.234567)), balance("USDT", dec!(5))],
            earn: Some(vec![staked("ETH", dec!(0.5))]),
            prices: prices(&[("ETH", dec!(2000))]),
            ..Default::default()
        });
        let report = execute(&acct, &TradeAction::SellAll { asset: "ETH".into() }, &cfg()).await;

        assert_eq!(report.status, ExecutionStatus::Filled, "{:?}", report.detail);
        assert_eq!(report.redeemed, Some(dec!(0.5)));
        inspect(&fake, |st| {
            assert_eq!(st.spot_orders[0].side, OrderSide::Sell);
            assert_eq!(st.spot_orders[0].quantity, dec!(1.73456));
        });
    }

    #[tokio::test]
    async fn venues_without_earn_still_trade() {
        let (acct, _fake) = account(State {
            balances: vec![balance("SOL", dec!(3))],
            earn: None,
            prices: prices(&[("SOL", dec!(150))]),
            ..Default::default()
        });
        let report = execute(&acct, &TradeAction::SellAll { asset: "SOL".into() }, &cfg()).await;
        assert_eq!(report.status, ExecutionStatus::Filled, "{:?}", report.detail);
        assert_eq!(report.redeemed, None);
    }

    #[tokio::test]
    async fn exchange_rejection_is_reported_as_failure() {
        let (acct, _fake) = account(State {
            balances: vec![balance("USDT", dec!(1000))],
            earn: Some(vec![]),
            prices: prices(&[("BTC", dec!(50000))]),
            fail_orders: true,
            ..Default::default()
        });
        let action = TradeAction::BuyToTarget {
            asset: "BTC".into(),
            percent: dec!(50),
        };
        let report = execute(&acct, &action, &cfg()).await;
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.detail.unwrap().contains("insufficient balance"));
    }

    #[tokio::test]
    async fn failed_buy_still_reports_the_redemption() {
        let (acct, fake) = account(State {
            balances: vec![balance("USDT", dec!(100))],
            earn: Some(vec![staked("USDT", dec!(900))]),
            prices: prices(&[("ETH", dec!(2000))]),
            fail_orders: true,
            ..Default::default()
        });
        let action = TradeAction::BuyToTarget {
            asset: "ETH".into(),
            percent: dec!(60),
        };
        let report = execute(&acct, &action, &cfg()).await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.redeemed, Some(dec!(500)));
        assert!(report.order_ids.is_empty());
        assert!(report.detail.unwrap().contains("insufficient balance"));
        inspect(&fake, |st| {
            assert_eq!(st.redemptions, vec![("USDT".to_string(), dec!(500))]);
        });
    }

    #[tokio::test]
    async fn failed_sell_still_reports_the_redemption() {
        let (acct, _fake) = account(State {
            balances: vec![balance("ETH", dec!(1))],
            earn: Some(vec![staked("ETH", dec!(0.5))]),
            prices: prices(&[("ETH", dec!(2000))]),
            fail_orders: true,
            ..Default::default()
        });
        let report = execute(&acct, &TradeAction::SellAll { asset: "ETH".into() }, &cfg()).await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.redeemed, Some(dec!(0.5)));
    }

    #[test]
    fn validate_rejects_out_of_range_actions() {
        let buy = |percent| TradeAction::BuyToTarget {
            asset: "ETH".into(),
            percent,
        };
        assert_eq!(buy(dec!(150)).validate(), Err(PlanError::InvalidPercent(dec!(150))));
        assert_eq!(buy(dec!(0)).validate(), Err(PlanError::InvalidPercent(dec!(0))));
        assert_eq!(buy(dec!(100)).validate(), Ok(()));

        let open = TradeAction::OpenFutures {
            asset: "BTC".into(),
            side: PositionSide::Long,
            percent: dec!(10),
            leverage: 0,
        };
        assert_eq!(open.validate(), Err(PlanError::InvalidLeverage(0)));

        let sell = TradeAction::SellAll { asset: " ".into() };
        assert_eq!(sell.validate(), Err(PlanError::MissingAsset));
        assert_eq!(
            TradeAction::CloseFutures { asset: "BTC".into() }.validate(),
            Ok(())
        );
    }

    #[tokio::test]
    async fn opens_futures_with_leverage() {
        let (acct, fake) = account(State {
            prices: prices(&[("BTC", dec!(50000))]),
            futures: Some(FuturesAccount {
                wallet_balance: dec!(1000),
                available: dec!(1000),
                ..Default::default()
            }),
            ..Default::default()
        });
        let action = TradeAction::OpenFutures {
            asset: "BTC".into(),
            side: PositionSide::Short,
            percent: dec!(50),
            leverage: 3,
        };
        let report = execute(&acct, &action, &cfg()).await;

        assert_eq!(report.status, ExecutionStatus::Filled, "{:?}", report.detail);
        inspect(&fake, |st| {
            assert_eq!(st.leverage, Some(3));
            let order = &st.futures_orders[0];
            assert_eq!(order.side, OrderSide::Sell);
            assert!(!order.reduce_only);
            // 500 margin * 3 = 1500 notional / 50000 = 0.03, less buffer
            assert_eq!(order.quantity, dec!(0.02994));
        });
    }

    #[tokio::test]
    async fn closes_futures_reduce_only() {
        let (acct, fake) = account(State {
            futures: Some(FuturesAccount {
                wallet_balance: dec!(1000),
                available: dec!(800),
                unrealized_pnl: dec!(12),
                positions: vec![FuturesPosition {
                    symbol: "BTC-USDT".into(),
                    side: PositionSide::Long,
                    size: dec!(0.01),
                    entry_price: dec!(60000),
                    mark_price: dec!(61200),
                    unrealized_pnl: dec!(12),
                    leverage: dec!(5),
                }],
            }),
            ..Default::default()
        });
        let report = execute(&acct, &TradeAction::CloseFutures { asset: "BTC".into() }, &cfg()).await;

        assert_eq!(report.status, ExecutionStatus::Filled, "{:?}", report.detail);
        inspect(&fake, |st| {
            let order = &st.futures_orders[0];
            assert_eq!(order.side, OrderSide::Sell);
            assert!(order.reduce_only);
            assert_eq!(order.quantity, dec!(0.01));
        });
    }

    #[tokio::test]
    async fn futures_on_spot_only_venue_fails_cleanly() {
        let (acct, _fake) = account(State::default());
        let report = execute(&acct, &TradeAction::CloseFutures { asset: "BTC".into() }, &cfg()).await;
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.detail.unwrap().contains("does not support futures"));
    }

    #[tokio::test]
    async fn execute_all_keeps_input_order() {
        let mk = |id: &str, usdt: Decimal| Account {
            credential_id: id.into(),
            label: id.into(),
            exchange: Arc::new(
                FakeExchange::new(State {
                    balances: vec![balance("USDT", usdt)],
                    earn: Some(vec![]),
                    prices: prices(&[("BTC", dec!(50000))]),
                    ..Default::default()
                })
                .with_rules(LotRules {
                    step: dec!(0.00001),
                    min_qty: dec!(0.00001),
                    max_qty: None,
                    min_notional: dec!(10),
                }),
            ),
        };
        let accounts = vec![mk("a", dec!(1000)), mk("b", dec!(1)), mk("c", dec!(500))];
        let action = TradeAction::BuyToTarget {
            asset: "BTC".into(),
            percent: dec!(10),
        };
        let reports = execute_all(accounts, action, cfg(), 2).await;

        let ids: Vec<_> = reports.iter().map(|r| r.credential_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(reports[0].status, ExecutionStatus::Filled);
        assert_eq!(reports[1].status, ExecutionStatus::Skipped);
        assert_eq!(reports[2].status, ExecutionStatus::Filled);
    }

    #[test]
    fn actions_deserialize_from_tagged_json() {
        let a: TradeAction =
            serde_json::from_str(r#"{"action":"buy_to_target","asset":"btc","percent":25}"#).unwrap();
        assert_eq!(
            a.normalized(),
            TradeAction::BuyToTarget {
                asset: "BTC".into(),
                percent: dec!(25)
            }
        );
        let a: TradeAction = serde_json::from_str(
            r#"{"action":"open_futures","asset":"ETH","side":"long","percent":"10"}"#,
        )
        .unwrap();
        assert!(matches!(a, TradeAction::OpenFutures { leverage: 1, .. }));
    }
}
