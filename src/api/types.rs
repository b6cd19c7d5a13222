use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::{ApiKeys, Venue};
use crate::trading::executor::ExecutionReport;
use crate::trading::portfolio::{Pnl, PortfolioSummary};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub credentials: u64,
}

// -- Auth --

#[derive(Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
}

// -- Credentials --

#[derive(Deserialize)]
pub struct NewCredential {
    pub label: String,
    pub exchange: Venue,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub invested: Option<Decimal>,
}

#[derive(Deserialize, Default)]
pub struct CredentialPatch {
    pub label: Option<String>,
    pub enabled: Option<bool>,
    pub invested: Option<Decimal>,
    #[serde(default)]
    pub clear_invested: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct CredentialSummary {
    pub id: String,
    pub label: String,
    pub exchange: Venue,
    pub api_key_hint: String,
    pub invested: Option<Decimal>,
    pub enabled: bool,
    pub created_at: String,
}

/// A stored credential set with its secrets opened.
#[derive(Clone, Debug)]
pub struct Credential {
    pub summary: CredentialSummary,
    pub keys: ApiKeys,
}

#[derive(Default)]
pub struct CredentialFilter {
    pub exchange: Option<Venue>,
    pub label: Option<String>,
}

#[derive(Serialize)]
pub struct CredentialsResponse {
    pub credentials: Vec<CredentialSummary>,
}

// -- Portfolio --

#[derive(Serialize)]
pub struct AccountPortfolio {
    pub credential_id: String,
    pub label: String,
    pub summary: PortfolioSummary,
    pub pnl: Pnl,
}

#[derive(Serialize)]
pub struct PortfolioResponse {
    pub quote: String,
    pub accounts: Vec<AccountPortfolio>,
    pub total_value: Decimal,
    pub total_pnl: Option<Decimal>,
}

// -- Executions --

#[derive(Serialize)]
pub struct TradeResponse {
    pub report: ExecutionReport,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub executed: usize,
    pub reports: Vec<ExecutionReport>,
}

#[derive(Deserialize)]
pub struct ExecutionsParams {
    pub credential_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub credential_id: String,
    pub label: String,
    pub venue: String,
    pub source: String,
    pub action: serde_json::Value,
    pub status: String,
    pub order_ids: Vec<String>,
    pub quantity: Option<String>,
    pub quote_amount: Option<String>,
    pub redeemed: Option<String>,
    pub detail: Option<String>,
    pub created_at: String,
}

#[derive(Serialize)]
pub struct ExecutionsResponse {
    pub executions: Vec<ExecutionRecord>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}
