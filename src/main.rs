// =============================================================================
// Momentum Ladder — Main Entry Point
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use momentum_ladder::account_state::AccountState;
use momentum_ladder::candle_history::CandleHistory;
use momentum_ladder::config::Config;
use momentum_ladder::engine::Engine;
use momentum_ladder::feed::market::BinanceMarketFeed;
use momentum_ladder::feed::user_stream::BinanceUserStream;
use momentum_ladder::gateway::binance::BinanceGateway;
use momentum_ladder::gateway::OrderGateway;
use momentum_ladder::logging;
use momentum_ladder::state_store::JsonFileStateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let config = Config::load(&config_path)?;

    let account_names: Vec<String> = config.accounts.iter().map(|a| a.name.clone()).collect();
    let _logging_guards = logging::init("logs", &account_names)?;

    info!("momentum ladder engine starting up");
    info!(pairs = config.pairs.len(), accounts = config.accounts.len(), "configuration loaded");

    let state_dir = std::env::var("STATE_DIR").unwrap_or_else(|_| ".".to_string());
    let store = Arc::new(JsonFileStateStore::new(state_dir));
    let account_state = Arc::new(AccountState::new(store));

    let symbols: Vec<String> = config.pairs.iter().map(|p| p.symbol.clone()).collect();
    account_state.initialize(&account_names, &config.pairs);

    let candle_history = Arc::new(CandleHistory::new(config.candle_capacity, symbols));

    let mut gateways: HashMap<String, Arc<dyn OrderGateway>> = HashMap::new();
    let mut user_streams: HashMap<String, Arc<dyn momentum_ladder::feed::UserStream>> = HashMap::new();
    for account in &config.accounts {
        let gateway = Arc::new(BinanceGateway::new(
            account.api_key.as_str(),
            account.api_secret.as_str(),
            config.order_url.as_str(),
        ));
        gateways.insert(account.name.clone(), gateway);
        let user_stream = Arc::new(BinanceUserStream::new(config.order_url.as_str(), account.api_key.as_str()));
        user_streams.insert(account.name.clone(), user_stream);
    }

    let market_feed = Arc::new(BinanceMarketFeed::new(config.order_url.as_str()));

    let engine = Arc::new(Engine::new(
        config.clone(),
        Arc::clone(&candle_history),
        Arc::clone(&account_state),
        gateways,
        market_feed,
    ));

    engine.backfill_all().await;

    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = momentum_ladder::health::serve(health_port).await {
            error!(error = %e, "health endpoint terminated unexpectedly");
        }
    });

    let engine_for_klines = Arc::clone(&engine);
    tokio::spawn(async move {
        engine_for_klines.run().await;
    });

    let engine_for_user_streams = Arc::clone(&engine);
    tokio::spawn(async move {
        engine_for_user_streams.run_user_streams(user_streams).await;
    });

    let engine_for_rate_limits = Arc::clone(&engine);
    tokio::spawn(async move {
        engine_for_rate_limits.run_rate_limit_resets().await;
    });

    info!("all subsystems running, press ctrl+c to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    engine.shutdown().await;

    info!("momentum ladder engine shut down complete");
    Ok(())
}
