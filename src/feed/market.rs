// =============================================================================
// MarketFeed — kline websocket adapter with REST backfill
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::types::Candle;

/// Port over market data: REST backfill on startup, then a live candle
/// stream. Implementations deliver every closed candle once, in order; an
/// in-progress candle may be delivered repeatedly as it updates but must be
/// marked `is_closed = false` via the `on_candle` callback argument.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Fetch the most recent `limit` closed candles for `symbol` at
    /// `interval`, oldest-first, used to seed `CandleHistory` on startup.
    async fn backfill(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;

    /// Run the live kline stream for `symbol`/`interval`, invoking `on_candle`
    /// for every message with `(candle, is_closed)`. `on_connected` fires
    /// once the socket handshake completes, before the first message is
    /// read — the caller uses it to reset its reconnect-attempt counter on
    /// the `open` event rather than on this call merely returning. Returns
    /// when the connection drops or a read error occurs; the caller is
    /// responsible for reconnection policy.
    async fn stream(
        &self,
        symbol: &str,
        interval: &str,
        on_connected: &(dyn Fn() + Send + Sync),
        on_candle: &(dyn Fn(Candle, bool) + Send + Sync),
    ) -> Result<()>;
}

pub struct BinanceMarketFeed {
    rest_base_url: String,
    client: reqwest::Client,
}

impl BinanceMarketFeed {
    pub fn new(rest_base_url: impl Into<String>) -> Self {
        Self {
            rest_base_url: rest_base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n.as_f64().with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse one kline array entry from the `/fapi/v1/klines` REST response:
/// `[openTime, open, high, low, close, volume, closeTime, ...]`.
fn parse_rest_kline(entry: &serde_json::Value) -> Result<Candle> {
    let arr = entry.as_array().context("kline entry is not an array")?;
    if arr.len() < 7 {
        anyhow::bail!("kline entry has too few fields: {}", arr.len());
    }
    Ok(Candle {
        open_time: arr[0].as_i64().context("missing open_time")?,
        open: parse_string_f64(&arr[1], "open")?,
        high: parse_string_f64(&arr[2], "high")?,
        low: parse_string_f64(&arr[3], "low")?,
        close: parse_string_f64(&arr[4], "close")?,
        volume: parse_string_f64(&arr[5], "volume")?,
        close_time: arr[6].as_i64().context("missing close_time")?,
    })
}

/// Parse a single-stream kline websocket message:
/// `{ "e": "kline", "s": "BTCUSDT", "k": { "t","T","o","h","l","c","v","x",... } }`.
fn parse_ws_kline(text: &str) -> Result<(Candle, bool)> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse kline JSON")?;
    let k = &root["k"];
    let candle = Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
    };
    let is_closed = k["x"].as_bool().context("missing field k.x")?;
    Ok((candle, is_closed))
}

#[async_trait]
impl MarketFeed for BinanceMarketFeed {
    async fn backfill(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!("{}/fapi/v1/klines", self.rest_base_url);
        info!(symbol, interval, limit, "backfilling candle history");
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .context("backfill request failed")?
            .error_for_status()
            .context("backfill request returned error status")?;

        let body: serde_json::Value = resp.json().await.context("failed to parse backfill response")?;
        let entries = body.as_array().context("backfill response is not an array")?;
        entries.iter().map(parse_rest_kline).collect()
    }

    async fn stream(
        &self,
        symbol: &str,
        interval: &str,
        on_connected: &(dyn Fn() + Send + Sync),
        on_candle: &(dyn Fn(Candle, bool) + Send + Sync),
    ) -> Result<()> {
        let lower = symbol.to_lowercase();
        let url = format!("wss://fstream.binance.com/ws/{lower}@kline_{interval}");
        info!(url = %url, symbol, interval, "connecting to kline websocket");

        let (ws_stream, _response) = connect_async(&url).await.context("failed to connect to kline websocket")?;
        info!(symbol, interval, "kline websocket connected");
        on_connected();
        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_ws_kline(&text) {
                            Ok((candle, is_closed)) => {
                                debug!(symbol, close = candle.close, is_closed, "candle update");
                                on_candle(candle, is_closed);
                            }
                            Err(e) => warn!(error = %e, "failed to parse kline message"),
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(symbol, error = %e, "kline websocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol, interval, "kline websocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}
