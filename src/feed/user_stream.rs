// =============================================================================
// UserStream — account and order execution events
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::types::TriggerSide;

/// A fill or position-size change reported on `ACCOUNT_UPDATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountUpdateEvent {
    pub symbol: String,
    pub position_amount: f64,
    pub entry_price: f64,
}

/// An order-status transition reported on `ORDER_TRADE_UPDATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTradeUpdateEvent {
    pub symbol: String,
    pub order_id: u64,
    pub side: TriggerSide,
    pub status: String,
    pub is_reduce_only: bool,
}

/// Port over the exchange's authenticated user data stream: position and
/// order execution events that confirm fills the engine submitted.
#[async_trait]
pub trait UserStream: Send + Sync {
    /// Run the live user-data stream for one account, invoking the callbacks
    /// for every event. Returns when the connection drops; the caller handles
    /// reconnection (including refreshing the listen key).
    async fn stream(
        &self,
        on_account_update: &(dyn Fn(AccountUpdateEvent) + Send + Sync),
        on_order_trade_update: &(dyn Fn(OrderTradeUpdateEvent) + Send + Sync),
    ) -> Result<()>;
}

pub struct BinanceUserStream {
    rest_base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl BinanceUserStream {
    pub fn new(rest_base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            rest_base_url: rest_base_url.into(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn create_listen_key(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.rest_base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("failed to create listen key")?
            .error_for_status()
            .context("listen key request returned error status")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse listen key response")?;
        body["listenKey"]
            .as_str()
            .map(str::to_string)
            .context("missing listenKey in response")
    }

}

fn parse_side(raw: &str) -> TriggerSide {
    if raw.eq_ignore_ascii_case("BUY") {
        TriggerSide::Long
    } else {
        TriggerSide::Short
    }
}

/// Parse one `ACCOUNT_UPDATE` payload, yielding one event per position entry.
fn parse_account_update(root: &serde_json::Value) -> Vec<AccountUpdateEvent> {
    let positions = root["a"]["P"].as_array().cloned().unwrap_or_default();
    positions
        .iter()
        .filter_map(|p| {
            let symbol = p["s"].as_str()?.to_string();
            let position_amount = p["pa"].as_str()?.parse::<f64>().ok()?;
            let entry_price = p["ep"].as_str()?.parse::<f64>().ok()?;
            Some(AccountUpdateEvent {
                symbol,
                position_amount,
                entry_price,
            })
        })
        .collect()
}

fn parse_order_trade_update(root: &serde_json::Value) -> Option<OrderTradeUpdateEvent> {
    let o = &root["o"];
    Some(OrderTradeUpdateEvent {
        symbol: o["s"].as_str()?.to_string(),
        order_id: o["i"].as_u64()?,
        side: parse_side(o["S"].as_str()?),
        status: o["X"].as_str()?.to_string(),
        is_reduce_only: o["R"].as_bool().unwrap_or(false),
    })
}

#[async_trait]
impl UserStream for BinanceUserStream {
    async fn stream(
        &self,
        on_account_update: &(dyn Fn(AccountUpdateEvent) + Send + Sync),
        on_order_trade_update: &(dyn Fn(OrderTradeUpdateEvent) + Send + Sync),
    ) -> Result<()> {
        let listen_key = self.create_listen_key().await?;
        let url = format!("wss://fstream.binance.com/ws/{listen_key}");
        info!("connecting to user data stream");

        let (ws_stream, _response) = connect_async(&url).await.context("failed to connect to user data stream")?;
        info!("user data stream connected");
        let (_write, mut read) = ws_stream.split();

        let keepalive_handle = {
            let this_key = self.api_key.clone();
            let this_base = self.rest_base_url.clone();
            tokio::spawn(async move {
                let client = reqwest::Client::new();
                let url = format!("{this_base}/fapi/v1/listenKey");
                loop {
                    tokio::time::sleep(std::time::Duration::from_secs(30 * 60)).await;
                    if let Err(e) = client.put(&url).header("X-MBX-APIKEY", &this_key).send().await {
                        warn!(error = %e, "listen key keepalive failed");
                    }
                }
            })
        };

        let result = loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        let root: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(error = %e, "failed to parse user stream message");
                                continue;
                            }
                        };
                        match root["e"].as_str() {
                            Some("ACCOUNT_UPDATE") => {
                                for event in parse_account_update(&root) {
                                    debug!(symbol = %event.symbol, position_amount = event.position_amount, "account update");
                                    on_account_update(event);
                                }
                            }
                            Some("ORDER_TRADE_UPDATE") => {
                                if let Some(event) = parse_order_trade_update(&root) {
                                    debug!(symbol = %event.symbol, order_id = event.order_id, status = %event.status, "order trade update");
                                    on_order_trade_update(event);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "user data stream read error");
                    break Err(e.into());
                }
                None => {
                    warn!("user data stream ended");
                    break Ok(());
                }
            }
        };

        keepalive_handle.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_account_update_positions() {
        let root = serde_json::json!({
            "e": "ACCOUNT_UPDATE",
            "a": { "P": [{ "s": "BTCUSDT", "pa": "0.010", "ep": "35000.0" }] }
        });
        let events = parse_account_update(&root);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol, "BTCUSDT");
        assert!((events[0].position_amount - 0.010).abs() < 1e-9);
    }

    #[test]
    fn parses_order_trade_update() {
        let root = serde_json::json!({
            "e": "ORDER_TRADE_UPDATE",
            "o": { "s": "BTCUSDT", "i": 42, "S": "SELL", "X": "FILLED", "R": true }
        });
        let event = parse_order_trade_update(&root).unwrap();
        assert_eq!(event.order_id, 42);
        assert_eq!(event.side, TriggerSide::Short);
        assert!(event.is_reduce_only);
    }

    #[test]
    fn flat_position_amount_is_zero() {
        let root = serde_json::json!({
            "a": { "P": [{ "s": "ETHUSDT", "pa": "0", "ep": "0" }] }
        });
        let events = parse_account_update(&root);
        assert_eq!(events[0].position_amount, 0.0);
    }
}
