// =============================================================================
// Hot Tier — venue WebSocket streams for bars and orderbooks
// =============================================================================
//
// Streams are per (symbol, timeframe); the caller owns the reconnect loop
// with backoff, so a runner returns on disconnect instead of retrying
// internally. Per-symbol timestamps are monotonic: an out-of-order or
// duplicate bar is counted and dropped, never inserted.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::facade::depth::BookLevel;
use crate::types::{Bar, Timeframe};

// ---------------------------------------------------------------------------
// Bar buffer
// ---------------------------------------------------------------------------

/// Key for one bar stream.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct StreamKey {
    pub pair: String,
    pub timeframe: Timeframe,
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pair, self.timeframe)
    }
}

/// Thread-safe ring buffer of closed bars per (pair, timeframe), plus an
/// in-progress bar that is replaced in place until it closes.
pub struct BarBuffer {
    buffers: RwLock<HashMap<StreamKey, VecDeque<(Bar, bool)>>>,
    max_bars: usize,
    /// Messages dropped for breaking per-symbol monotonicity.
    dropped: AtomicU64,
}

impl BarBuffer {
    pub fn new(max_bars: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_bars,
            dropped: AtomicU64::new(0),
        }
    }

    /// Insert or replace the latest bar. Closed bars append (and trim);
    /// open bars replace an open bar with the same `ts`. Anything older
    /// than the newest stored bar is dropped and counted.
    pub fn update(&self, key: StreamKey, bar: Bar, is_closed: bool) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        if let Some((last, last_closed)) = ring.back() {
            if bar.ts < last.ts || (bar.ts == last.ts && *last_closed) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if bar.ts == last.ts && !*last_closed {
                ring.pop_back();
            }
        }

        ring.push_back((bar, is_closed));
        while ring.len() > self.max_bars {
            ring.pop_front();
        }
    }

    /// The most recent `count` closed bars, oldest first.
    pub fn closed_bars(&self, key: &StreamKey, count: usize) -> Vec<Bar> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Bar> =
                    ring.iter().filter(|(_, c)| *c).map(|(b, _)| b).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|b| **b).collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the newest closed bar, if any.
    pub fn last_close(&self, key: &StreamKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)?
            .iter()
            .rev()
            .find(|(_, closed)| *closed)
            .map(|(b, _)| b.close)
    }

    /// Total messages dropped for ordering violations.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Live orderbook levels
// ---------------------------------------------------------------------------

/// Latest raw book levels per pair, fed by the depth stream.
pub struct BookManager {
    books: RwLock<HashMap<String, LiveBook>>,
}

/// The raw levels the depth module turns into a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LiveBook {
    pub pair: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub last_update_id: u64,
}

impl BookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the book for a pair; stale update ids are ignored.
    pub fn update(&self, pair: &str, bids: Vec<BookLevel>, asks: Vec<BookLevel>, update_id: u64) {
        let mut books = self.books.write();
        if let Some(existing) = books.get(pair) {
            if update_id <= existing.last_update_id {
                return;
            }
        }
        books.insert(
            pair.to_string(),
            LiveBook {
                pair: pair.to_string(),
                bids,
                asks,
                last_update_id: update_id,
            },
        );
    }

    pub fn get(&self, pair: &str) -> Option<LiveBook> {
        self.books.read().get(pair).cloned()
    }
}

impl Default for BookManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Binance kline stream
// ---------------------------------------------------------------------------

/// Binance market id for a USD pair: the venue's "USD" books are its USDT
/// markets, so `BTCUSD` maps to `btcusdt`.
fn binance_market(pair: &str) -> String {
    format!("{}t", pair.to_lowercase())
}

/// Binance stream interval label for a timeframe.
fn binance_interval(tf: Timeframe) -> &'static str {
    match tf {
        Timeframe::H1 => "1h",
        Timeframe::H4 => "4h",
        Timeframe::H12 => "12h",
        Timeframe::H24 => "1d",
        Timeframe::D7 => "1w",
    }
}

/// Connect to the Binance kline stream for one (pair, timeframe) and feed
/// bars into `buffer`. Returns when the stream ends or errors; the caller
/// handles reconnection.
pub async fn run_kline_stream(
    pair: &str,
    timeframe: Timeframe,
    buffer: &Arc<BarBuffer>,
) -> Result<()> {
    let market = binance_market(pair);
    let interval = binance_interval(timeframe);
    let url = format!("wss://stream.binance.com:9443/ws/{market}@kline_{interval}");
    info!(url = %url, pair, %timeframe, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(pair, %timeframe, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_message(&text, timeframe) {
                        Ok((bar, is_closed)) => {
                            debug!(pair, ts = bar.ts, close = bar.close, is_closed, "bar update");
                            buffer.update(
                                StreamKey {
                                    pair: pair.to_string(),
                                    timeframe,
                                },
                                bar,
                                is_closed,
                            );
                        }
                        Err(e) => warn!(error = %e, "failed to parse kline message"),
                    }
                }
                // Ping/Pong/Binary frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(pair, error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(pair, %timeframe, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance kline payload (single-stream or combined envelope).
fn parse_kline_message(text: &str, _timeframe: Timeframe) -> Result<(Bar, bool)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };
    let k = &data["k"];

    let bar = Bar {
        ts: k["t"].as_i64().context("missing field k.t")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
    };
    let is_closed = k["x"].as_bool().context("missing field k.x")?;
    Ok((bar, is_closed))
}

/// Binance encodes numerics as JSON strings inside kline objects.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Binance depth stream
// ---------------------------------------------------------------------------

/// Connect to the Binance partial depth stream (`@depth20@100ms`) for one
/// pair and feed raw levels into `manager`.
pub async fn run_depth_stream(pair: &str, manager: &Arc<BookManager>) -> Result<()> {
    let market = binance_market(pair);
    let url = format!("wss://stream.binance.com:9443/ws/{market}@depth20@100ms");
    info!(url = %url, pair, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(pair, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_depth_message(&text) {
                        Ok((bids, asks, update_id)) => {
                            manager.update(pair, bids, asks, update_id);
                        }
                        Err(e) => warn!(error = %e, "failed to parse depth message"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(pair, error = %e, "depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(pair, "depth WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance partial-depth message into raw levels.
fn parse_depth_message(text: &str) -> Result<(Vec<BookLevel>, Vec<BookLevel>, u64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let update_id = root["lastUpdateId"]
        .as_u64()
        .context("missing field lastUpdateId")?;

    let parse_side = |side: &serde_json::Value, name: &str| -> Result<Vec<BookLevel>> {
        side.as_array()
            .with_context(|| format!("missing field {name}"))?
            .iter()
            .map(|level| {
                let price = level
                    .get(0)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .with_context(|| format!("bad price in {name}"))?;
                let qty = level
                    .get(1)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .with_context(|| format!("bad qty in {name}"))?;
                Ok(BookLevel { price, qty })
            })
            .collect()
    };

    Ok((
        parse_side(&root["bids"], "bids")?,
        parse_side(&root["asks"], "asks")?,
        update_id,
    ))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    fn key(pair: &str) -> StreamKey {
        StreamKey {
            pair: pair.to_string(),
            timeframe: Timeframe::H1,
        }
    }

    #[test]
    fn ring_trims_to_capacity() {
        let buf = BarBuffer::new(3);
        for i in 0..5 {
            buf.update(key("BTCUSD"), bar(i * 3_600_000, 100.0 + i as f64), true);
        }
        let bars = buf.closed_bars(&key("BTCUSD"), 10);
        assert_eq!(bars.len(), 3);
        assert!((bars[0].close - 102.0).abs() < f64::EPSILON);
    }

    #[test]
    fn in_progress_bar_is_replaced_until_closed() {
        let buf = BarBuffer::new(10);
        buf.update(key("ETHUSD"), bar(0, 50.0), false);
        buf.update(key("ETHUSD"), bar(0, 51.0), false);
        buf.update(key("ETHUSD"), bar(0, 52.0), true);
        assert_eq!(buf.closed_bars(&key("ETHUSD"), 10).len(), 1);
        assert_eq!(buf.last_close(&key("ETHUSD")), Some(52.0));
    }

    #[test]
    fn out_of_order_bars_are_dropped_and_counted() {
        let buf = BarBuffer::new(10);
        buf.update(key("BTCUSD"), bar(3_600_000, 101.0), true);
        buf.update(key("BTCUSD"), bar(0, 100.0), true); // older: dropped
        buf.update(key("BTCUSD"), bar(3_600_000, 102.0), true); // dup of closed: dropped

        assert_eq!(buf.dropped_messages(), 2);
        let bars = buf.closed_bars(&key("BTCUSD"), 10);
        assert_eq!(bars.len(), 1);
        assert!((bars[0].close - 101.0).abs() < f64::EPSILON);
    }

    #[test]
    fn closed_bars_excludes_in_progress() {
        let buf = BarBuffer::new(10);
        buf.update(key("BTCUSD"), bar(0, 100.0), true);
        buf.update(key("BTCUSD"), bar(3_600_000, 101.0), false);
        assert_eq!(buf.closed_bars(&key("BTCUSD"), 10).len(), 1);
    }

    #[test]
    fn book_manager_ignores_stale_updates() {
        let mgr = BookManager::new();
        let lvl = |p: f64| vec![BookLevel { price: p, qty: 1.0 }];
        mgr.update("BTCUSD", lvl(100.0), lvl(101.0), 10);
        mgr.update("BTCUSD", lvl(90.0), lvl(91.0), 5); // stale
        let book = mgr.get("BTCUSD").unwrap();
        assert_eq!(book.last_update_id, 10);
        assert!((book.bids[0].price - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_kline_message_both_envelopes() {
        let inner = r#"{
            "e": "kline", "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700003599999, "i": "1h",
                "o": "37000.00", "h": "37050.00", "l": "36990.00",
                "c": "37020.00", "v": "123.456", "q": "4567890.12",
                "n": 1500, "V": "60.1", "Q": "2224455.6", "x": true
            }
        }"#;
        let (bar, closed) = parse_kline_message(inner, Timeframe::H1).unwrap();
        assert_eq!(bar.ts, 1_700_000_000_000);
        assert!((bar.close - 37_020.0).abs() < f64::EPSILON);
        assert!(closed);

        let wrapped = format!(r#"{{ "stream": "btcusdt@kline_1h", "data": {inner} }}"#);
        let (bar2, _) = parse_kline_message(&wrapped, Timeframe::H1).unwrap();
        assert_eq!(bar.ts, bar2.ts);
    }

    #[test]
    fn parse_depth_message_levels() {
        let json = r#"{
            "lastUpdateId": 42,
            "bids": [["100.0", "1.5"], ["99.5", "2.0"]],
            "asks": [["100.5", "1.0"]]
        }"#;
        let (bids, asks, id) = parse_depth_message(json).unwrap();
        assert_eq!(id, 42);
        assert_eq!(bids.len(), 2);
        assert_eq!(asks.len(), 1);
        assert!((bids[1].qty - 2.0).abs() < f64::EPSILON);
    }
}
