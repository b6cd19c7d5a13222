use std::sync::{Arc, Mutex};

use axum::{
    Router,
    routing::{get, patch, post},
};
use rusqlite::Connection;
use tower_http::cors::{Any, CorsLayer};

use super::vault::Vault;
use super::{routes, webhook};
use crate::config::Config;
use crate::exchange::{self, Exchange};
use crate::trading::executor::{Account, ExecutorConfig};

use super::types::Credential;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub vault: Vault,
    pub http: reqwest::Client,
    pub jwt_secret: Arc<Vec<u8>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(conn: Connection, vault: Vault, config: Config) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
            vault,
            http: reqwest::Client::new(),
            jwt_secret: Arc::new(config.jwt_secret.clone()),
            config: Arc::new(config),
        }
    }

    /// Locks the store. A poisoned lock is recovered; SQLite keeps its own consistency.
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn exchange_for(&self, credential: &Credential) -> Arc<dyn Exchange> {
        exchange::connect(
            credential.summary.exchange,
            credential.keys.clone(),
            &self.config.endpoints,
            self.http.clone(),
        )
    }

    pub fn account_for(&self, credential: &Credential) -> Account {
        Account {
            credential_id: credential.summary.id.clone(),
            label: credential.summary.label.clone(),
            exchange: self.exchange_for(credential),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            quote: self.config.quote_asset.clone(),
            fee_buffer: self.config.fee_buffer,
            redeem_settle: self.config.redeem_settle,
        }
    }
}

#[cfg(test)]
impl AppState {
    /// Migrated in-memory store with fixed keys.
    pub(crate) fn for_tests(tradingview_secret: &str) -> Self {
        let conn = Connection::open_in_memory().expect("in-memory db");
        super::db::migrate(&conn).expect("migrations");
        let vault = Vault::from_hex(&"42".repeat(32)).expect("vault key");
        let config = Config {
            port: 0,
            db_path: ":memory:".into(),
            jwt_secret: b"test-jwt-secret".to_vec(),
            admin_password: "hunter2".into(),
            vault_key: "42".repeat(32),
            tradingview_secret: tradingview_secret.into(),
            quote_asset: "USDT".into(),
            redeem_settle: std::time::Duration::ZERO,
            fee_buffer: rust_decimal::Decimal::new(2, 3),
            max_parallel_accounts: 2,
            endpoints: exchange::Endpoints {
                binance: "http://127.0.0.1:9".into(),
                bybit: "http://127.0.0.1:9".into(),
                bingx: "http://127.0.0.1:9".into(),
            },
        };
        Self::new(conn, vault, config)
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/auth/login", post(routes::login))
        .route(
            "/api/credentials",
            get(routes::list_credentials).post(routes::create_credential),
        )
        .route(
            "/api/credentials/{id}",
            patch(routes::update_credential).delete(routes::delete_credential),
        )
        .route(
            "/api/credentials/{id}/portfolio",
            get(routes::credential_portfolio),
        )
        .route("/api/credentials/{id}/trade", post(routes::trade))
        .route("/api/portfolio", get(routes::portfolio))
        .route("/api/executions", get(routes::executions))
        .route("/webhooks/tradingview", post(webhook::tradingview))
        .layer(cors)
        .with_state(state)
}

pub async fn run(state: AppState, port: u16) {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("Failed to bind");

    tracing::info!("API server listening on port {port}");
    axum::serve(listener, app).await.expect("Server failed");
}
