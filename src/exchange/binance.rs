//! Binance-style spot REST gateway.
//!
//! Handles request signing (HMAC-SHA256 over the query string), exchange
//! filter parsing, kline retrieval, and order submission. Transient
//! failures are retried internally with bounded exponential backoff;
//! everything else surfaces as a classified [`ExchangeError`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, Error as BackoffError, ExponentialBackoff};
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::models::{parse_filter_decimal, Bar, InstrumentConstraints, Position};

use super::types::{
    ExchangeError, LiquiditySnapshot, OrderRequest, OrderResult, OrderStatus,
};
use super::ExchangeGateway;

const PROD_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";

/// Quote assets recognized when splitting a symbol into base/quote.
const QUOTE_ASSETS: &[&str] = &["USDT", "USDC", "FDUSD", "BTC", "ETH", "BNB"];

type HmacSha256 = Hmac<Sha256>;

/// REST gateway for a Binance-compatible spot API.
pub struct BinanceGateway {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceGateway {
    /// Build from environment: `BINANCE_API_KEY`, `BINANCE_API_SECRET`,
    /// and `BINANCE_TESTNET=1` to target the testnet.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY")
            .map_err(|_| anyhow::anyhow!("BINANCE_API_KEY not set"))?;
        let api_secret = std::env::var("BINANCE_API_SECRET")
            .map_err(|_| anyhow::anyhow!("BINANCE_API_SECRET not set"))?;

        let testnet = std::env::var("BINANCE_TESTNET")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self::new(
            if testnet { TESTNET_URL } else { PROD_URL },
            api_key,
            api_secret,
        ))
    }

    pub fn new(base_url: &str, api_key: String, api_secret: String) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        }
    }

    fn backoff_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }

    /// Retry an operation while it fails transiently.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        retry(Self::backoff_policy(), || async {
            op().await.map_err(|e| {
                if e.is_transient() {
                    warn!(error = %e, "transient exchange error, backing off");
                    BackoffError::transient(e)
                } else {
                    BackoffError::permanent(e)
                }
            })
        })
        .await
    }

    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|_| ExchangeError::Authentication("invalid API secret".to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn post_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let mut query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");

        let signature = self.sign(&query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );

        let response = self
            .http
            .post(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn get_signed<T: DeserializeOwned>(&self, path: &str) -> Result<T, ExchangeError> {
        let query = format!("timestamp={}", Utc::now().timestamp_millis());
        let signature = self.sign(&query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );

        let response = self
            .http
            .get(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ExchangeError::Parse(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_api_error(status, &body))
    }
}

/// Map an error response onto the retry taxonomy.
fn classify_api_error(status: reqwest::StatusCode, body: &str) -> ExchangeError {
    #[derive(Deserialize)]
    struct ApiError {
        #[serde(default)]
        code: i64,
        #[serde(default)]
        msg: String,
    }

    if status.as_u16() == 429 || status.as_u16() == 418 || status.is_server_error() {
        return ExchangeError::Transient(format!("HTTP {}: {}", status, body));
    }

    let parsed: ApiError = serde_json::from_str(body).unwrap_or(ApiError {
        code: 0,
        msg: body.to_string(),
    });

    // -1013 is the generic filter failure; the message names the filter
    if parsed.code == -1013
        || parsed.msg.contains("LOT_SIZE")
        || parsed.msg.contains("PRICE_FILTER")
        || parsed.msg.contains("Filter failure")
    {
        return ExchangeError::FilterViolation(parsed.msg);
    }

    match parsed.code {
        -1003 | -1021 => ExchangeError::Transient(parsed.msg),
        -1022 | -2014 | -2015 => ExchangeError::Authentication(parsed.msg),
        _ => ExchangeError::Rejected(parsed.msg),
    }
}

/// Split a symbol like `BTCUSDT` into its base asset.
fn base_asset(symbol: &str) -> &str {
    for quote in QUOTE_ASSETS {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return base;
            }
        }
    }
    symbol
}

// ==================== Wire Types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFilter {
    filter_type: String,
    #[serde(default)]
    min_qty: Option<String>,
    #[serde(default)]
    max_qty: Option<String>,
    #[serde(default)]
    step_size: Option<String>,
    #[serde(default)]
    min_price: Option<String>,
    #[serde(default)]
    tick_size: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    bid_price: String,
    ask_price: String,
    quote_volume: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    balances: Vec<Balance>,
}

#[derive(Debug, Deserialize)]
struct Balance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderResponse {
    order_id: i64,
    client_order_id: String,
    status: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    cummulative_quote_qty: String,
}

fn parse_order_status(s: &str) -> OrderStatus {
    match s {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        _ => OrderStatus::Rejected,
    }
}

fn parse_constraints(info: &SymbolInfo) -> Result<InstrumentConstraints, ExchangeError> {
    let mut constraints = InstrumentConstraints {
        symbol: info.symbol.clone(),
        min_qty: Decimal::ZERO,
        max_qty: None,
        step_size: Decimal::ZERO,
        min_price: Decimal::ZERO,
        tick_size: Decimal::ZERO,
    };

    let parse = |s: &str| {
        parse_filter_decimal(s).map_err(|e| ExchangeError::Parse(e.to_string()))
    };

    for filter in &info.filters {
        match filter.filter_type.as_str() {
            "LOT_SIZE" => {
                if let Some(v) = &filter.min_qty {
                    constraints.min_qty = parse(v)?;
                }
                if let Some(v) = &filter.step_size {
                    constraints.step_size = parse(v)?;
                }
                if let Some(v) = &filter.max_qty {
                    let max = parse(v)?;
                    // Binance publishes an absurdly large sentinel for
                    // effectively unbounded symbols; treat it as no bound
                    constraints.max_qty = if max >= Decimal::from(9_000_000_000u64) {
                        None
                    } else {
                        Some(max)
                    };
                }
            }
            "PRICE_FILTER" => {
                if let Some(v) = &filter.min_price {
                    constraints.min_price = parse(v)?;
                }
                if let Some(v) = &filter.tick_size {
                    constraints.tick_size = parse(v)?;
                }
            }
            _ => {}
        }
    }

    if constraints.step_size.is_zero() || constraints.tick_size.is_zero() {
        return Err(ExchangeError::Parse(format!(
            "missing LOT_SIZE or PRICE_FILTER for {}",
            info.symbol
        )));
    }

    Ok(constraints)
}

fn parse_bar(row: &serde_json::Value) -> Result<Bar, ExchangeError> {
    let field = |idx: usize| -> Result<Decimal, ExchangeError> {
        row.get(idx)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::Parse(format!("kline field {} missing", idx)))
            .and_then(|s| {
                parse_filter_decimal(s).map_err(|e| ExchangeError::Parse(e.to_string()))
            })
    };

    let open_time_ms = row
        .get(0)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ExchangeError::Parse("kline open time missing".to_string()))?;
    let open_time = Utc
        .timestamp_millis_opt(open_time_ms)
        .single()
        .ok_or_else(|| ExchangeError::Parse("kline open time out of range".to_string()))?;

    Ok(Bar {
        open_time,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("quantity", request.quantity.to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];
        match request.price {
            Some(price) => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", price.to_string()));
            }
            None => params.push(("type", "MARKET".to_string())),
        }

        let response: NewOrderResponse = self
            .with_retry(|| self.post_signed("/api/v3/order", &params))
            .await?;

        let executed_qty = parse_filter_decimal(&response.executed_qty)
            .unwrap_or(Decimal::ZERO);
        let quote_qty = parse_filter_decimal(&response.cummulative_quote_qty)
            .unwrap_or(Decimal::ZERO);
        let avg_fill_price = if executed_qty.is_zero() {
            request.price.unwrap_or(Decimal::ZERO)
        } else {
            quote_qty / executed_qty
        };

        debug!(
            symbol = %request.symbol,
            order_id = response.order_id,
            status = %response.status,
            executed = %executed_qty,
            "order placed"
        );

        Ok(OrderResult {
            order_id: response.order_id.to_string(),
            client_order_id: response.client_order_id,
            status: parse_order_status(&response.status),
            executed_qty,
            avg_fill_price,
        })
    }

    async fn get_instrument_constraints(
        &self,
        symbol: &str,
    ) -> Result<InstrumentConstraints, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let info: ExchangeInfoResponse = self
            .with_retry(|| self.get_json("/api/v3/exchangeInfo", &params))
            .await?;

        let symbol_info = info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| {
                ExchangeError::Parse(format!("symbol {} missing from exchangeInfo", symbol))
            })?;

        parse_constraints(symbol_info)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        let account: AccountResponse = self
            .with_retry(|| self.get_signed("/api/v3/account"))
            .await?;

        let base = base_asset(symbol);
        let Some(balance) = account.balances.iter().find(|b| b.asset == base) else {
            return Ok(None);
        };

        let free = parse_filter_decimal(&balance.free)
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let locked = parse_filter_decimal(&balance.locked)
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;
        let quantity = free + locked;
        if quantity.is_zero() {
            return Ok(None);
        }

        // Spot balances carry no entry price; mark at the current price so
        // reconciliation at least sees the right exposure
        let price = self.get_market_price(symbol).await?;
        let mut position = Position::flat(symbol);
        position.quantity = quantity;
        position.avg_entry_price = price;
        position.last_price = price;

        Ok(Some(position))
    }

    async fn get_market_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let ticker: TickerPrice = self
            .with_retry(|| self.get_json("/api/v3/ticker/price", &params))
            .await?;

        parse_filter_decimal(&ticker.price).map_err(|e| ExchangeError::Parse(e.to_string()))
    }

    async fn get_recent_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<serde_json::Value> = self
            .with_retry(|| self.get_json("/api/v3/klines", &params))
            .await?;

        rows.iter().map(parse_bar).collect()
    }

    async fn get_liquidity(&self, symbol: &str) -> Result<LiquiditySnapshot, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let ticker: Ticker24h = self
            .with_retry(|| self.get_json("/api/v3/ticker/24hr", &params))
            .await?;

        let parse =
            |s: &str| parse_filter_decimal(s).map_err(|e| ExchangeError::Parse(e.to_string()));

        Ok(LiquiditySnapshot {
            bid: parse(&ticker.bid_price)?,
            ask: parse(&ticker.ask_price)?,
            quote_volume_24h: parse(&ticker.quote_volume)?,
        })
    }
}
