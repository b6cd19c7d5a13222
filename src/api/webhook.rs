use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::auth;
use super::db;
use super::server::AppState;
use super::types::{CredentialFilter, WebhookResponse};
use crate::exchange::{PositionSide, Venue};
use crate::trading::executor::{self, TradeAction};

/// TradingView alert body. Alerts are configured with a JSON message template,
/// but TradingView posts it as `text/plain`, so the body is parsed by hand.
#[derive(Debug, Deserialize)]
pub struct Signal {
    #[serde(default)]
    pub secret: Option<String>,
    pub action: String,
    pub asset: String,
    #[serde(default)]
    pub percent: Option<Decimal>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub exchange: Option<Venue>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SignalError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("action '{0}' requires percent")]
    MissingPercent(String),
    #[error("unknown side '{0}' (expected long or short)")]
    UnknownSide(String),
    #[error("asset is required")]
    MissingAsset,
}

fn parse_side(raw: &str) -> Result<PositionSide, SignalError> {
    match raw.trim().to_lowercase().as_str() {
        "long" | "buy" => Ok(PositionSide::Long),
        "short" | "sell" => Ok(PositionSide::Short),
        other => Err(SignalError::UnknownSide(other.to_string())),
    }
}

impl Signal {
    pub fn to_action(&self) -> Result<TradeAction, SignalError> {
        let asset = self.asset.trim().to_string();
        if asset.is_empty() {
            return Err(SignalError::MissingAsset);
        }
        let action = self.action.trim().to_lowercase();
        let percent = || {
            self.percent
                .ok_or_else(|| SignalError::MissingPercent(action.clone()))
        };
        let leverage = self.leverage.unwrap_or(1);

        let trade = match action.as_str() {
            "buy" | "buy_to_target" | "rebalance" => TradeAction::BuyToTarget {
                asset,
                percent: percent()?,
            },
            "sell" | "sell_all" | "exit" => TradeAction::SellAll { asset },
            "long" | "open_long" => TradeAction::OpenFutures {
                asset,
                side: PositionSide::Long,
                percent: percent()?,
                leverage,
            },
            "short" | "open_short" => TradeAction::OpenFutures {
                asset,
                side: PositionSide::Short,
                percent: percent()?,
                leverage,
            },
            "open_futures" => TradeAction::OpenFutures {
                asset,
                side: parse_side(self.side.as_deref().unwrap_or(""))?,
                percent: percent()?,
                leverage,
            },
            "close" | "close_futures" => TradeAction::CloseFutures { asset },
            _ => return Err(SignalError::UnknownAction(action.clone())),
        };
        Ok(trade.normalized())
    }

    fn filter(&self) -> CredentialFilter {
        CredentialFilter {
            exchange: self.exchange,
            label: self
                .label
                .as_ref()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
        }
    }
}

// ---------------------------------------------------------------------------
// POST /webhooks/tradingview
// ---------------------------------------------------------------------------

pub async fn tradingview(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let signal: Signal = serde_json::from_str(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid signal: {e}")))?;

    // Validate shared secret, from the body or the header
    let expected = &state.config.tradingview_secret;
    if !expected.is_empty() {
        let header = headers
            .get("x-webhook-secret")
            .and_then(|v| v.to_str().ok());
        let accepted = [signal.secret.as_deref(), header]
            .into_iter()
            .flatten()
            .any(|provided| auth::secrets_match(provided, expected));
        if !accepted {
            tracing::warn!("tradingview webhook rejected: bad secret");
            return Err((StatusCode::UNAUTHORIZED, "Invalid shared secret".into()));
        }
    }

    let action = signal
        .to_action()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    action
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let credentials = db::load_enabled_credentials(&state.conn(), &state.vault, &signal.filter())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:?}")))?;
    tracing::info!(
        "tradingview signal {:?} -> {} account(s)",
        action,
        credentials.len()
    );

    let accounts = credentials.iter().map(|c| state.account_for(c)).collect();
    let reports = executor::execute_all(
        accounts,
        action,
        state.executor_config(),
        state.config.max_parallel_accounts,
    )
    .await;

    {
        let conn = state.conn();
        for report in &reports {
            if let Err(e) = db::record_execution(&conn, report, "webhook") {
                tracing::error!("[{}] failed to record execution: {e}", report.label);
            }
        }
    }

    Ok(Json(WebhookResponse {
        executed: reports.len(),
        reports,
    }))
}
