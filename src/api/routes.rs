use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use rust_decimal::Decimal;

use super::auth::{self, AuthError};
use super::db::{self, StoreError};
use super::middleware::AuthUser;
use super::server::AppState;
use super::types::{
    AccountPortfolio, Credential, CredentialFilter, CredentialPatch, CredentialsResponse,
    ExecutionsParams, ExecutionsResponse, HealthResponse, LoginRequest, LoginResponse,
    NewCredential, PortfolioResponse, TradeResponse,
};
use crate::trading::executor::{self, TradeAction};
use crate::trading::portfolio::{self, PortfolioSummary};

type ApiResult<T> = Result<T, (StatusCode, String)>;

const DEFAULT_EXECUTIONS_LIMIT: u32 = 50;
const MAX_EXECUTIONS_LIMIT: u32 = 200;

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn store_error(e: StoreError) -> (StatusCode, String) {
    match e {
        StoreError::NotFound => (StatusCode::NOT_FOUND, "Credential not found".into()),
        StoreError::DuplicateLabel => (
            StatusCode::CONFLICT,
            "A credential with this label already exists".into(),
        ),
        StoreError::Vault(e) => {
            tracing::error!("vault failure: {e}");
            internal(e)
        }
        StoreError::Db(e) => internal(e),
    }
}

pub async fn health(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let credentials = db::count_credentials(&state.conn()).map_err(internal)?;
    Ok(Json(HealthResponse {
        status: "ok",
        credentials,
    }))
}

// -- Auth --

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthError> {
    auth::verify_password(&body.password, &state.config.admin_password).inspect_err(|_| {
        tracing::warn!("rejected admin login");
    })?;
    let token = auth::issue_jwt(&state.jwt_secret)?;
    Ok(Json(LoginResponse { token }))
}

// -- Credentials --

pub async fn list_credentials(
    _auth: AuthUser,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let credentials = db::list_credentials(&state.conn()).map_err(internal)?;
    Ok(Json(CredentialsResponse { credentials }))
}

pub async fn create_credential(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Json(body): Json<NewCredential>,
) -> ApiResult<impl IntoResponse> {
    if body.label.trim().is_empty() || body.label.len() > 100 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Label must be 1-100 characters".into(),
        ));
    }
    if body.api_key.trim().is_empty() || body.api_secret.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "API key and secret are required".into(),
        ));
    }
    if body.invested.is_some_and(|i| i.is_sign_negative()) {
        return Err((
            StatusCode::BAD_REQUEST,
            "Invested amount cannot be negative".into(),
        ));
    }

    let summary =
        db::create_credential(&state.conn(), &state.vault, &body).map_err(store_error)?;
    tracing::info!(
        "{user} registered {} credential '{}'",
        summary.exchange,
        summary.label
    );
    Ok((StatusCode::CREATED, Json(summary)))
}

pub async fn update_credential(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CredentialPatch>,
) -> ApiResult<impl IntoResponse> {
    if body
        .label
        .as_ref()
        .is_some_and(|l| l.trim().is_empty() || l.len() > 100)
    {
        return Err((
            StatusCode::BAD_REQUEST,
            "Label must be 1-100 characters".into(),
        ));
    }
    let summary = db::update_credential(&state.conn(), &id, &body).map_err(store_error)?;
    Ok(Json(summary))
}

pub async fn delete_credential(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    db::delete_credential(&state.conn(), &id).map_err(store_error)?;
    tracing::info!("{user} deleted credential {id}");
    Ok(StatusCode::NO_CONTENT)
}

// -- Portfolio --

async fn account_portfolio(state: &AppState, credential: &Credential) -> ApiResult<AccountPortfolio> {
    let exchange = state.exchange_for(credential);
    let summary = portfolio::summarize(exchange.as_ref(), &state.config.quote_asset).await;
    with_pnl(&state.conn(), credential, summary).map_err(internal)
}

/// Derives PNL against the previous snapshot, then stores this total as the
/// next one. Incomplete summaries are not stored.
fn with_pnl(
    conn: &rusqlite::Connection,
    credential: &Credential,
    summary: PortfolioSummary,
) -> Result<AccountPortfolio, rusqlite::Error> {
    let id = &credential.summary.id;
    let previous = db::previous_snapshot(conn, id)?;
    if summary.complete {
        db::record_snapshot(conn, id, summary.total_value)?;
    } else {
        tracing::warn!(
            "[{}] partial portfolio read, snapshot not stored",
            credential.summary.label
        );
    }
    let pnl = portfolio::pnl(summary.total_value, credential.summary.invested, previous);

    Ok(AccountPortfolio {
        credential_id: id.clone(),
        label: credential.summary.label.clone(),
        summary,
        pnl,
    })
}

pub async fn credential_portfolio(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let credential = db::load_credential(&state.conn(), &state.vault, &id).map_err(store_error)?;
    Ok(Json(account_portfolio(&state, &credential).await?))
}

pub async fn portfolio(
    _auth: AuthUser,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let credentials =
        db::load_enabled_credentials(&state.conn(), &state.vault, &CredentialFilter::default())
            .map_err(store_error)?;

    let results = futures_util::future::join_all(
        credentials.iter().map(|c| account_portfolio(&state, c)),
    )
    .await;

    let mut accounts = Vec::with_capacity(results.len());
    for result in results {
        accounts.push(result?);
    }

    let total_value: Decimal = accounts.iter().map(|a| a.summary.total_value).sum();
    let pnls: Vec<Decimal> = accounts.iter().filter_map(|a| a.pnl.pnl).collect();
    let total_pnl = (!pnls.is_empty()).then(|| pnls.iter().copied().sum());

    Ok(Json(PortfolioResponse {
        quote: state.config.quote_asset.clone(),
        accounts,
        total_value,
        total_pnl,
    }))
}

// -- Trading --

pub async fn trade(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(action): Json<TradeAction>,
) -> ApiResult<impl IntoResponse> {
    let action = action.normalized();
    action
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let credential = db::load_credential(&state.conn(), &state.vault, &id).map_err(store_error)?;
    if !credential.summary.enabled {
        return Err((StatusCode::CONFLICT, "Credential is disabled".into()));
    }

    let account = state.account_for(&credential);
    let report = executor::execute(&account, &action, &state.executor_config()).await;

    db::record_execution(&state.conn(), &report, "manual").map_err(internal)?;
    Ok(Json(TradeResponse { report }))
}

pub async fn executions(
    _auth: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<ExecutionsParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_EXECUTIONS_LIMIT)
        .clamp(1, MAX_EXECUTIONS_LIMIT);
    let offset = params.offset.unwrap_or(0);

    let (executions, total) =
        db::list_executions(&state.conn(), params.credential_id.as_deref(), limit, offset)
            .map_err(internal)?;

    Ok(Json(ExecutionsResponse {
        executions,
        total,
        limit,
        offset,
    }))
}
