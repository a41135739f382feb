//! Binance USDⓈ-M futures source: combined-stream WebSocket for 1m klines
//! and aggregated trades, REST backfill for historical klines.

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use msr_core::candle::{Candle, Timeframe, Trade};

use crate::source::{ExchangeSource, MarketEvent, SourceHandle};

const REST_KLINE_LIMIT: usize = 1_500;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub struct BinanceSource {
    ws_url: String,
    rest_url: String,
    http: reqwest::Client,
    rest_timeout: Duration,
    rest_min_gap: Duration,
    pacer: Arc<tokio::sync::Mutex<Instant>>,
    ping_secs: u64,
}

impl BinanceSource {
    pub fn from_env() -> Result<Self> {
        let ws_url = env_string("MSR_BINANCE_WS_URL", "wss://fstream.binance.com/stream");
        let rest_url = env_string("MSR_BINANCE_REST_URL", "https://fapi.binance.com");
        let rest_timeout = Duration::from_secs(env_u64("MSR_BINANCE_REST_TIMEOUT_S", 10).max(1));
        // Basic pacing to stay clear of REST weight limits during
        // aggressive multi-symbol backfills.
        let rest_min_gap = Duration::from_millis(env_u64("MSR_BINANCE_REST_MIN_GAP_MS", 250));
        let ping_secs = env_u64("MSR_BINANCE_WS_PING_SECS", 50).max(5);

        let http = reqwest::Client::builder()
            .user_agent("msr-engine")
            .build()
            .context("build reqwest client")?;

        Ok(Self {
            ws_url,
            rest_url,
            http,
            rest_timeout,
            rest_min_gap,
            pacer: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            ping_secs,
        })
    }

    fn stream_url(&self, symbols: &[String]) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let sym = s.to_ascii_lowercase();
                [format!("{sym}@kline_1m"), format!("{sym}@aggTrade")]
            })
            .collect();
        format!("{}?streams={}", self.ws_url, streams.join("/"))
    }

    async fn rest_pace(&self) {
        if self.rest_min_gap.is_zero() {
            return;
        }
        // The pacer stores the earliest instant the next request may start.
        let sleep_until = {
            let mut guard = self.pacer.lock().await;
            let now = Instant::now();
            let when = if *guard > now { *guard } else { now };
            *guard = when + self.rest_min_gap;
            when
        };
        let now = Instant::now();
        if sleep_until > now {
            tokio::time::sleep(sleep_until - now).await;
        }
    }

    async fn fetch_klines_chunk(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let url = format!("{}/fapi/v1/klines", self.rest_url);
        let max_retries = 3usize;
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=max_retries {
            self.rest_pace().await;
            let res = self
                .http
                .get(&url)
                .query(&[
                    ("symbol", symbol.to_string()),
                    ("interval", timeframe.as_str().to_string()),
                    ("startTime", start_ms.to_string()),
                    ("endTime", (end_ms - 1).to_string()),
                    ("limit", REST_KLINE_LIMIT.to_string()),
                ])
                .timeout(self.rest_timeout)
                .send()
                .await;

            let mut backoff: Option<Duration> = None;
            match res {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body: Value = resp.json().await.context("klines response json")?;
                        return parse_rest_klines(&body, symbol, timeframe);
                    }
                    last_err = Some(anyhow!("klines HTTP {status}"));
                    if status.as_u16() == 429 {
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok());
                        backoff = Some(
                            retry_after
                                .map(Duration::from_secs)
                                .unwrap_or_else(|| Duration::from_secs(attempt as u64 * 2))
                                .min(Duration::from_secs(60)),
                        );
                    }
                }
                Err(e) => last_err = Some(anyhow!("klines request failed: {e}")),
            }

            if attempt < max_retries {
                let d = backoff
                    .unwrap_or_else(|| Duration::from_millis(200 * (attempt as u64).pow(2)));
                tokio::time::sleep(d).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("klines fetch failed")))
    }
}

impl ExchangeSource for BinanceSource {
    async fn subscribe(
        &self,
        symbols: &[String],
        events: mpsc::Sender<MarketEvent>,
    ) -> Result<SourceHandle> {
        let url = self.stream_url(symbols);
        let (ws, _) = connect_async(url.as_str()).await.context("binance ws connect")?;
        tracing::info!(symbols = symbols.len(), "binance stream connected");

        let ping_secs = self.ping_secs;
        let task = tokio::spawn(async move {
            let (mut write, mut read) = ws.split();
            let mut ping = tokio::time::interval(Duration::from_secs(ping_secs));
            ping.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(event) = parse_stream_message(&text) {
                                    if events.send(event).await.is_err() {
                                        // Receiver gone: pipeline shut down.
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                tracing::warn!(?frame, "binance stream closed by server");
                                return;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "binance stream error");
                                return;
                            }
                            None => {
                                tracing::warn!("binance stream ended");
                                return;
                            }
                        }
                    }
                    _ = ping.tick() => {
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            tracing::warn!("binance ping failed, dropping stream");
                            return;
                        }
                    }
                }
            }
        });

        Ok(SourceHandle::new(vec![task]))
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>> {
        let period = timeframe.period_ms();
        let mut out: Vec<Candle> = Vec::new();
        let mut cur = from_ms;

        while cur < to_ms {
            let chunk = self.fetch_klines_chunk(symbol, timeframe, cur, to_ms).await?;
            if chunk.is_empty() {
                break;
            }
            let last_open = chunk.last().expect("non-empty chunk").open_time_ms;
            let full_chunk = chunk.len() >= REST_KLINE_LIMIT;
            out.extend(chunk.into_iter().filter(|c| c.open_time_ms < to_ms));
            if !full_chunk {
                break;
            }
            // Guaranteed forward progress even on odd server responses.
            cur = (last_open + period).max(cur + period);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

fn value_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    if let Some(f) = v.as_f64() {
        return Some(f);
    }
    v.as_str()?.parse::<f64>().ok()
}

fn value_i64(v: Option<&Value>) -> Option<i64> {
    let v = v?;
    if let Some(i) = v.as_i64() {
        return Some(i);
    }
    v.as_str()?.parse::<i64>().ok()
}

/// Parse one combined-stream message into a market event. Unknown or
/// malformed payloads yield `None` and are skipped.
pub fn parse_stream_message(text: &str) -> Option<MarketEvent> {
    let root: Value = serde_json::from_str(text).ok()?;
    let data = root.get("data").unwrap_or(&root);
    match data.get("e").and_then(Value::as_str) {
        Some("kline") => parse_kline(data).map(MarketEvent::Bar),
        Some("aggTrade") => parse_agg_trade(data).map(MarketEvent::Trade),
        _ => None,
    }
}

fn parse_kline(data: &Value) -> Option<Candle> {
    let k = data.get("k")?;
    let interval = k.get("i").and_then(Value::as_str)?;
    let timeframe = interval.parse::<Timeframe>().ok()?;
    Some(Candle {
        symbol: data.get("s").and_then(Value::as_str)?.to_string(),
        timeframe,
        open_time_ms: value_i64(k.get("t"))?,
        open: value_f64(k.get("o"))?,
        high: value_f64(k.get("h"))?,
        low: value_f64(k.get("l"))?,
        close: value_f64(k.get("c"))?,
        volume: value_f64(k.get("v"))?,
        closed: k.get("x").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_agg_trade(data: &Value) -> Option<Trade> {
    Some(Trade {
        symbol: data.get("s").and_then(Value::as_str)?.to_string(),
        timestamp_ms: value_i64(data.get("T"))?,
        price: value_f64(data.get("p"))?,
        quantity: value_f64(data.get("q"))?,
    })
}

/// Parse the REST klines response (array of arrays). Only bars whose
/// close time has passed are returned as closed.
fn parse_rest_klines(body: &Value, symbol: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
    let rows = body
        .as_array()
        .ok_or_else(|| anyhow!("klines response is not an array"))?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let cols = match row.as_array() {
            Some(cols) if cols.len() >= 6 => cols,
            _ => continue,
        };
        let open_time = match value_i64(cols.first()) {
            Some(t) => t,
            None => continue,
        };
        let (open, high, low, close, volume) = match (
            value_f64(cols.get(1)),
            value_f64(cols.get(2)),
            value_f64(cols.get(3)),
            value_f64(cols.get(4)),
            value_f64(cols.get(5)),
        ) {
            (Some(o), Some(h), Some(l), Some(c), Some(v)) => (o, h, l, c, v),
            _ => continue,
        };
        out.push(Candle {
            symbol: symbol.to_string(),
            timeframe,
            open_time_ms: open_time,
            open,
            high,
            low,
            close,
            volume,
            closed: true,
        });
    }
    Ok(out)
}
