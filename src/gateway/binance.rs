// =============================================================================
// BinanceGateway — USDⓈ-M futures adapter implementing the OrderGateway port
// =============================================================================
//
// Signing and the signed-query-string shape are carried over from this
// project's spot REST client; the endpoints and order payloads below are the
// futures (`/fapi`) equivalents, since perpetuals need `positionSide`,
// `workingType=MARK_PRICE`, and `closePosition` reduce-only stops that the
// spot API has no concept of.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::gateway::rate_limit::RateLimitTracker;
use crate::gateway::{EntryOrders, EntrySubmission, OrderGateway, RateLimitWindow, SymbolPrecision};
use crate::types::TriggerSide;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
/// Tolerance for treating two stop prices as "the same" when checking
/// whether a trailing stop is already installed (§4.7 idempotence rule).
const STOP_PRICE_EPSILON: f64 = 1e-8;

pub struct BinanceGateway {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    pub rate_limiter: RateLimitTracker,
    precision_cache: RwLock<HashMap<String, SymbolPrecision>>,
}

impl BinanceGateway {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: base_url.into(),
            client,
            rate_limiter: RateLimitTracker::new(),
            precision_cache: RwLock::new(HashMap::new()),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn round_to(value: f64, decimals: u32) -> f64 {
        let factor = 10f64.powi(decimals as i32);
        (value * factor).round() / factor
    }

    async fn position_amount(&self, symbol: &str) -> Result<f64> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.context("GET /fapi/v2/positionRisk failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse positionRisk response")?;
        if !status.is_success() {
            bail!("Binance GET /fapi/v2/positionRisk returned {}: {}", status, body);
        }

        let entries = body.as_array().cloned().unwrap_or_default();
        let amount = entries
            .first()
            .and_then(|e| e["positionAmt"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok(amount)
    }
}

#[async_trait]
impl OrderGateway for BinanceGateway {
    #[instrument(skip(self), name = "gateway::symbol_precision")]
    async fn symbol_precision(&self, symbol: &str) -> Result<SymbolPrecision> {
        if let Some(p) = self.precision_cache.read().get(symbol) {
            return Ok(*p);
        }

        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.context("GET /fapi/v1/exchangeInfo failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse exchangeInfo response")?;
        if !status.is_success() {
            bail!("Binance GET /fapi/v1/exchangeInfo returned {}: {}", status, body);
        }

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("symbol not found in exchangeInfo response")?;

        let precision = SymbolPrecision {
            price_precision: info["pricePrecision"].as_u64().unwrap_or(2) as u32,
            quantity_precision: info["quantityPrecision"].as_u64().unwrap_or(3) as u32,
        };

        self.precision_cache.write().insert(symbol.to_string(), precision);
        debug!(symbol, ?precision, "symbol precision cached");
        Ok(precision)
    }

    #[instrument(skip(self), name = "gateway::position_exists")]
    async fn position_exists(&self, symbol: &str) -> Result<bool> {
        Ok(self.position_amount(symbol).await?.abs() > 0.0)
    }

    #[instrument(skip(self), name = "gateway::submit_entry_with_stop")]
    async fn submit_entry_with_stop(
        &self,
        symbol: &str,
        side: TriggerSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<EntrySubmission> {
        if !self.rate_limiter.can_place_order() {
            bail!("rate limit: cannot place order for {symbol} right now");
        }

        let precision = self.symbol_precision(symbol).await?;
        let qty = Self::round_to(quantity, precision.quantity_precision);
        let stop = Self::round_to(stop_price, precision.price_precision);

        let (entry_side, stop_side, position_side) = match side {
            TriggerSide::Long => ("BUY", "SELL", "LONG"),
            TriggerSide::Short => ("SELL", "BUY", "SHORT"),
        };

        let batch = serde_json::json!([
            {
                "symbol": symbol,
                "side": entry_side,
                "type": "MARKET",
                "quantity": qty,
                "positionSide": position_side,
            },
            {
                "symbol": symbol,
                "side": stop_side,
                "type": "STOP_MARKET",
                "stopPrice": stop,
                "closePosition": "true",
                "workingType": "MARK_PRICE",
                "positionSide": position_side,
            },
        ]);

        let params = format!("batchOrders={}", serde_json::to_string(&batch)?);
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/batchOrders?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.context("POST /fapi/v1/batchOrders failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        self.rate_limiter.record_order_sent();
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse batchOrders response")?;
        if !status.is_success() {
            bail!("Binance POST /fapi/v1/batchOrders returned {}: {}", status, body);
        }

        let entries = body.as_array().cloned().unwrap_or_default();
        if entries.len() != 2 {
            bail!("expected 2 order results from batchOrders, got {}: {}", entries.len(), body);
        }

        if let Some(code) = entries[0].get("code") {
            bail!("entry order rejected: code={code} msg={}", entries[0]["msg"]);
        }
        let entry_order_id = entries[0]["orderId"].as_u64().context("missing entry orderId")?;

        if let Some(code) = entries[1].get("code") {
            warn!(symbol, entry_order_id, %code, "protective stop rejected, entry already filled");
            return Ok(EntrySubmission::EntryOnlyStopRejected {
                entry_order_id,
                reason: format!("code={code} msg={}", entries[1]["msg"]),
            });
        }
        let stop_order_id = entries[1]["orderId"].as_u64().context("missing stop orderId")?;

        debug!(symbol, entry_order_id, stop_order_id, "paired entry+stop submitted");
        Ok(EntrySubmission::BothPlaced(EntryOrders { entry_order_id, stop_order_id }))
    }

    #[instrument(skip(self), name = "gateway::place_trail_stop")]
    async fn place_trail_stop(&self, symbol: &str, for_side: TriggerSide, stop_price: f64) -> Result<()> {
        let precision = self.symbol_precision(symbol).await?;
        let stop = Self::round_to(stop_price, precision.price_precision);

        let qs = self.signed_query(&format!("symbol={symbol}"));
        let url = format!("{}/fapi/v1/openOrders?{}", self.base_url, qs);
        let resp = self.client.get(&url).send().await.context("GET /fapi/v1/openOrders failed")?;
        let status = resp.status();
        let open_orders: serde_json::Value = resp.json().await.context("failed to parse openOrders response")?;
        if !status.is_success() {
            bail!("Binance GET /fapi/v1/openOrders returned {}: {}", status, open_orders);
        }

        let already_placed = open_orders.as_array().into_iter().flatten().any(|order| {
            let is_stop_market = order["type"].as_str() == Some("STOP_MARKET");
            let existing_stop = order["stopPrice"]
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(f64::NAN);
            is_stop_market && (existing_stop - stop).abs() < STOP_PRICE_EPSILON
        });

        if already_placed {
            debug!(symbol, stop, "trailing stop already installed, skipping");
            return Ok(());
        }

        self.cancel_all_open_orders(symbol).await?;

        if !self.rate_limiter.can_place_order() {
            bail!("rate limit: cannot place trailing stop for {symbol} right now");
        }

        let stop_side = match for_side {
            TriggerSide::Long => "SELL",
            TriggerSide::Short => "BUY",
        };
        let position_side = match for_side {
            TriggerSide::Long => "LONG",
            TriggerSide::Short => "SHORT",
        };

        let params = format!(
            "symbol={symbol}&side={stop_side}&type=STOP_MARKET&stopPrice={stop}&closePosition=true&workingType=MARK_PRICE&positionSide={position_side}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.context("POST /fapi/v1/order (trail stop) failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        self.rate_limiter.record_order_sent();
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse trail stop response")?;
        if !status.is_success() {
            bail!("Binance POST /fapi/v1/order (trail stop) returned {}: {}", status, body);
        }

        debug!(symbol, stop, "trailing stop installed");
        Ok(())
    }

    #[instrument(skip(self), name = "gateway::cancel_all_open_orders")]
    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()> {
        let qs = self.signed_query(&format!("symbol={symbol}"));
        let url = format!("{}/fapi/v1/allOpenOrders?{}", self.base_url, qs);

        let resp = self.client.delete(&url).send().await.context("DELETE /fapi/v1/allOpenOrders failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            warn!(symbol, %status, %body, "cancel-all-open-orders returned non-success");
        }
        Ok(())
    }

    #[instrument(skip(self), name = "gateway::close_position")]
    async fn close_position(&self, symbol: &str) -> Result<()> {
        let precision = self.symbol_precision(symbol).await?;
        let amount = self.position_amount(symbol).await?;
        if amount == 0.0 {
            debug!(symbol, "close_position called on flat symbol, no-op");
            return Ok(());
        }

        let side = if amount > 0.0 { "SELL" } else { "BUY" };
        let qty = Self::round_to(amount.abs(), precision.quantity_precision);

        let params = format!("symbol={symbol}&side={side}&type=MARKET&quantity={qty}&reduceOnly=true");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.context("POST /fapi/v1/order (close) failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        self.rate_limiter.record_order_sent();
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse close-position response")?;
        if !status.is_success() {
            bail!("Binance POST /fapi/v1/order (close) returned {}: {}", status, body);
        }

        debug!(symbol, qty, side, "position closed via market order");
        Ok(())
    }

    fn reset_rate_limit_window(&self, window: RateLimitWindow) {
        match window {
            RateLimitWindow::TenSeconds => self.rate_limiter.reset_10s_counter(),
            RateLimitWindow::OneMinute => self.rate_limiter.reset_1m_weight(),
            RateLimitWindow::OneDay => self.rate_limiter.reset_daily_counter(),
        }
    }
}

impl std::fmt::Debug for BinanceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceGateway")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_matches_precision() {
        assert_eq!(BinanceGateway::round_to(1.23456, 2), 1.23);
        assert_eq!(BinanceGateway::round_to(1.23456, 0), 1.0);
    }

    #[test]
    fn signing_is_deterministic_for_same_query() {
        let gw = BinanceGateway::new("key", "secret", "https://fapi.binance.com");
        let a = gw.sign("foo=bar");
        let b = gw.sign("foo=bar");
        assert_eq!(a, b);
        assert_ne!(a, gw.sign("foo=baz"));
    }
}
