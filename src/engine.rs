// =============================================================================
// Engine loop — wires MarketFeed/UserStream to per-account processing
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::account_state::AccountState;
use crate::candle_history::CandleHistory;
use crate::config::Config;
use crate::entry_engine::EntryEngine;
use crate::feed::user_stream::{AccountUpdateEvent, OrderTradeUpdateEvent};
use crate::feed::{MarketFeed, UserStream};
use crate::gateway::{OrderGateway, RateLimitWindow};
use crate::movement_detector;
use crate::trigger_runner::TriggerRunner;
use crate::types::{Candle, PositionStatus};

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const ONE_MINUTE: Duration = Duration::from_secs(60);
const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-account collaborators the engine dispatches a price tick to.
struct AccountHandle {
    name: String,
    entry_engine: Arc<EntryEngine>,
    trigger_runner: Arc<TriggerRunner>,
    gateway: Arc<dyn OrderGateway>,
}

pub struct Engine {
    config: Config,
    candle_history: Arc<CandleHistory>,
    account_state: Arc<AccountState>,
    accounts: Vec<AccountHandle>,
    market_feed: Arc<dyn MarketFeed>,
}

impl Engine {
    pub fn new(
        config: Config,
        candle_history: Arc<CandleHistory>,
        account_state: Arc<AccountState>,
        gateways: HashMap<String, Arc<dyn OrderGateway>>,
        market_feed: Arc<dyn MarketFeed>,
    ) -> Self {
        let accounts = config
            .accounts
            .iter()
            .map(|acct| {
                let gateway = gateways
                    .get(&acct.name)
                    .unwrap_or_else(|| panic!("no gateway configured for account {}", acct.name))
                    .clone();
                AccountHandle {
                    name: acct.name.clone(),
                    entry_engine: Arc::new(EntryEngine::new(Arc::clone(&account_state), Arc::clone(&gateway))),
                    trigger_runner: Arc::new(TriggerRunner::new(Arc::clone(&account_state), Arc::clone(&gateway))),
                    gateway,
                }
            })
            .collect();

        Self {
            config,
            candle_history,
            account_state,
            accounts,
            market_feed,
        }
    }

    /// Backfill every configured pair's candle history from the exchange.
    /// Called once at startup, before any websocket subscription.
    pub async fn backfill_all(&self) {
        for pair in &self.config.pairs {
            match self
                .market_feed
                .backfill(&pair.symbol, &self.config.websocket_interval, self.config.candle_capacity as u32)
                .await
            {
                Ok(candles) => {
                    for candle in candles {
                        if let Err(e) = self.candle_history.append(&pair.symbol, candle) {
                            warn!(symbol = %pair.symbol, error = %e, "failed to append backfilled candle");
                        }
                    }
                    info!(symbol = %pair.symbol, count = self.candle_history.len(&pair.symbol), "backfill complete");
                }
                Err(e) => {
                    warn!(symbol = %pair.symbol, error = %e, "backfill failed, starting with empty history");
                }
            }
        }
    }

    /// Run the kline stream for every configured pair concurrently, with
    /// bounded reconnection. Returns once all pair tasks have ended (normally
    /// only on shutdown, since each task loops internally until its
    /// reconnect budget is exhausted).
    pub async fn run(self: Arc<Self>) {
        let mut handles = Vec::new();
        for pair in self.config.pairs.clone() {
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                engine.run_pair_with_reconnect(&pair.symbol).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_pair_with_reconnect(&self, symbol: &str) {
        let attempts = AtomicU32::new(0);
        loop {
            let attempt = attempts.load(Ordering::Relaxed);
            if attempt >= MAX_RECONNECT_ATTEMPTS {
                error!(symbol, attempts = attempt, "reconnect budget exhausted, giving up on this pair");
                return;
            }

            let on_connected = || {
                attempts.store(0, Ordering::Relaxed);
            };
            let on_candle = |candle: Candle, is_closed: bool| {
                self.dispatch_tick(symbol, &candle, is_closed);
            };

            let result = self
                .market_feed
                .stream(symbol, &self.config.websocket_interval, &on_connected, &on_candle)
                .await;

            if let Err(e) = result {
                let next = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(symbol, attempt = next, error = %e, "kline stream ended, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            } else {
                info!(symbol, "kline stream ended cleanly, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    /// Dispatch one tick: ArmCheck before TriggerRunner for every account
    /// (§5 ordering), and on a closed candle, MovementDetector before the
    /// history append.
    fn dispatch_tick(&self, symbol: &str, candle: &Candle, is_closed: bool) {
        if is_closed {
            self.run_movement_detector(symbol, candle);
        }

        let pair = match self.config.pairs.iter().find(|p| p.symbol == symbol) {
            Some(p) => p.clone(),
            None => return,
        };

        let price = candle.close;
        for account in &self.accounts {
            let entry_engine = Arc::clone(&account.entry_engine);
            let trigger_runner = Arc::clone(&account.trigger_runner);
            let account_name = account.name.clone();
            let symbol = symbol.to_string();
            let pair = pair.clone();
            tokio::spawn(async move {
                if let Err(e) = entry_engine.on_tick(&account_name, &symbol, price, &pair).await {
                    warn!(account = %account_name, symbol = %symbol, error = %e, "arm-check tick failed");
                }
                if let Err(e) = trigger_runner.on_tick(&account_name, &symbol, price).await {
                    warn!(account = %account_name, symbol = %symbol, error = %e, "trigger-runner tick failed");
                }
            });
        }

        if is_closed {
            if let Err(e) = self.candle_history.append(symbol, *candle) {
                warn!(symbol, error = %e, "failed to append closed candle to history");
            }
        }
    }

    fn run_movement_detector(&self, symbol: &str, candle: &Candle) {
        let pair = match self.config.pairs.iter().find(|p| p.symbol == symbol) {
            Some(p) => p,
            None => return,
        };

        // §4.2: H includes the just-closed candle, computed against the
        // history as currently stored (the real append happens after this).
        let mut history = match self.candle_history.snapshot(symbol) {
            Ok(h) => h,
            Err(e) => {
                warn!(symbol, error = %e, "movement detector could not read history");
                return;
            }
        };
        history.push(*candle);

        let result = match movement_detector::evaluate(&history, candle, pair) {
            Ok(r) => r,
            Err(e) => {
                warn!(symbol, error = %e, "movement detector skipped for this tick");
                return;
            }
        };

        if !result.triggered {
            return;
        }

        info!(symbol, average_diff = result.average_diff, dynamic_threshold = result.dynamic_threshold, "movement detected, arming accounts");

        for account in &self.accounts {
            let position = match self.account_state.get_position(&account.name, symbol) {
                Some(p) => p,
                None => continue,
            };
            if !can_arm(position.status) {
                continue;
            }
            let close = candle.close;
            let threshold = result.dynamic_threshold / 2.0;
            self.account_state.update_position(&account.name, symbol, |p| {
                p.status = PositionStatus::Armed;
                p.lock_close_price = Some(close);
                p.movement_threshold = Some(threshold);
            });
        }
    }

    /// Run the user-data stream for every configured account concurrently.
    pub async fn run_user_streams(self: Arc<Self>, streams: HashMap<String, Arc<dyn UserStream>>) {
        let mut handles = Vec::new();
        for account in &self.accounts {
            let name = account.name.clone();
            let engine = Arc::clone(&self);
            let stream = match streams.get(&name) {
                Some(s) => Arc::clone(s),
                None => continue,
            };
            handles.push(tokio::spawn(async move {
                engine.run_user_stream_with_reconnect(&name, stream).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_user_stream_with_reconnect(&self, account: &str, stream: Arc<dyn UserStream>) {
        let attempts = AtomicU32::new(0);
        loop {
            let attempt = attempts.load(Ordering::Relaxed);
            if attempt >= MAX_RECONNECT_ATTEMPTS {
                error!(account, attempts = attempt, "user-stream reconnect budget exhausted");
                return;
            }

            let on_account_update = |event: AccountUpdateEvent| {
                self.handle_account_update(account, event);
            };
            let on_order_trade_update = |event: OrderTradeUpdateEvent| {
                self.handle_order_trade_update(account, event);
            };

            let result = stream.stream(&on_account_update, &on_order_trade_update).await;
            match result {
                Ok(()) => {
                    attempts.store(0, Ordering::Relaxed);
                    info!(account, "user stream ended cleanly, reconnecting");
                }
                Err(e) => {
                    let next = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(account, attempt = next, error = %e, "user stream error, reconnecting");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    /// §4.7: a flat exchange position clears the record to idle; otherwise
    /// records the fill and transitions `entering -> open`, building the
    /// trigger ladder.
    fn handle_account_update(&self, account: &str, event: AccountUpdateEvent) {
        let pair = match self.config.pairs.iter().find(|p| p.symbol == event.symbol) {
            Some(p) => p.clone(),
            None => return,
        };

        if event.position_amount == 0.0 {
            self.account_state.update_position(account, &event.symbol, |p| p.clear());
            return;
        }

        let position = match self.account_state.get_position(account, &event.symbol) {
            Some(p) => p,
            None => return,
        };
        if position.status != PositionStatus::Entering {
            return;
        }

        let direction = if event.position_amount > 0.0 {
            crate::types::TriggerSide::Long
        } else {
            crate::types::TriggerSide::Short
        };
        let movement_threshold = position.movement_threshold.unwrap_or(0.0);
        let ladder = crate::trigger_ladder::build(
            event.entry_price,
            direction,
            movement_threshold,
            pair.fees_exemption_percentage,
            pair.trigger_count,
        );

        self.account_state.update_position(account, &event.symbol, |p| {
            p.status = PositionStatus::Open;
            p.entry_price = Some(event.entry_price);
            p.trigger_side = Some(direction);
            p.triggers = ladder.triggers;
            p.stop_prices = ladder.stop_prices;
        });
        info!(account, symbol = %event.symbol, entry_price = event.entry_price, "position opened, ladder built");
    }

    fn handle_order_trade_update(&self, account: &str, event: OrderTradeUpdateEvent) {
        debug_log_order_update(account, &event);
    }

    /// Periodically age out every account gateway's locally cached rate-limit
    /// usage: the 10-second order-count window on `Config::api_interval_secs`,
    /// the 1-minute weight window every minute, the daily window once a day.
    pub async fn run_rate_limit_resets(self: Arc<Self>) {
        let ten_second_interval = Duration::from_secs(self.config.api_interval_secs.max(1));
        let mut handles = Vec::new();
        for account in &self.accounts {
            let gateway = Arc::clone(&account.gateway);
            handles.push(tokio::spawn(async move {
                let mut ten_second_ticker = tokio::time::interval(ten_second_interval);
                let mut one_minute_ticker = tokio::time::interval(ONE_MINUTE);
                let mut one_day_ticker = tokio::time::interval(ONE_DAY);
                loop {
                    tokio::select! {
                        _ = ten_second_ticker.tick() => gateway.reset_rate_limit_window(RateLimitWindow::TenSeconds),
                        _ = one_minute_ticker.tick() => gateway.reset_rate_limit_window(RateLimitWindow::OneMinute),
                        _ = one_day_ticker.tick() => gateway.reset_rate_limit_window(RateLimitWindow::OneDay),
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Best-effort cleanup on interrupt: cancel resting orders for every
    /// account/pair so a restart doesn't race a stale ladder stop.
    pub async fn shutdown(&self) {
        info!("engine shutting down, cancelling open orders");
        for account in &self.accounts {
            for pair in &self.config.pairs {
                if let Err(e) = account.gateway.cancel_all_open_orders(&pair.symbol).await {
                    warn!(account = %account.name, symbol = %pair.symbol, error = %e, "failed to cancel open orders during shutdown");
                }
            }
        }
    }
}

/// A position already `entering` or `open` must not be re-armed by a fresh
/// movement-detector signal; it only arms from `idle`.
pub fn can_arm(status: PositionStatus) -> bool {
    !matches!(status, PositionStatus::Entering | PositionStatus::Open)
}

fn debug_log_order_update(account: &str, event: &OrderTradeUpdateEvent) {
    tracing::debug!(account, symbol = %event.symbol, order_id = event.order_id, status = %event.status, "order trade update received");
}
