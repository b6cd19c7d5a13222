use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod exchange;
mod trading;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let vault = match api::vault::Vault::from_hex(&config.vault_key) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    if config.tradingview_secret.is_empty() {
        tracing::warn!("TRADINGVIEW_SECRET is empty, webhook signals are accepted unauthenticated");
    }

    let conn = api::db::init_db(&config.db_path);
    let port = config.port;
    let state = api::server::AppState::new(conn, vault, config);

    api::server::run(state, port).await;
}
