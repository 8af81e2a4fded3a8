// =============================================================================
// Warm Tier — venue REST clients behind the safety layer
// =============================================================================
//
// Every request acquires a permit first and reports its outcome after, so
// rate limits, circuit breakers, and budgets see all warm-tier traffic.
// Server weight headers are mirrored back into the limiter where venues
// send them. 429/418 responses surface `Retry-After` to the limiter; other
// 4xx responses fail immediately without retry.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::facade::depth::BookLevel;
use crate::provider::{Outcome, SafetyLayer};
use crate::types::{Bar, Symbol, Timeframe, Venue};

/// Request timeout for all warm-tier calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for every venue the warm tier reaches.
pub struct WarmClient {
    http: reqwest::Client,
    safety: Arc<SafetyLayer>,
}

impl WarmClient {
    pub fn new(safety: Arc<SafetyLayer>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build warm-tier HTTP client");
        Self { http, safety }
    }

    // -------------------------------------------------------------------------
    // Safety-wrapped GET
    // -------------------------------------------------------------------------

    /// Acquire a permit, perform one GET, record the outcome, and mirror
    /// weight headers. `cost` is the venue's documented request weight.
    async fn get_json(
        &self,
        venue: Venue,
        url: &str,
        cost: u64,
        critical: bool,
    ) -> Result<serde_json::Value> {
        let permit = self
            .safety
            .acquire(venue, cost, critical)
            .map_err(|code| anyhow::anyhow!("{venue} request denied: {code}"))?;

        let started = Instant::now();
        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                self.safety
                    .record(permit, Outcome::Failure, started.elapsed());
                return Err(err).with_context(|| format!("GET {url} failed"));
            }
        };
        let latency = started.elapsed();
        let status = response.status();

        // Mirror server weight headers before judging the status.
        if venue == Venue::Binance {
            if let Some(used) = header_u64(response.headers(), "x-mbx-used-weight-1m") {
                self.safety.update_server_weight(venue, used, 1200);
            }
        }

        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after = header_u64(response.headers(), "retry-after")
                .map(Duration::from_secs);
            self.safety
                .record(permit, Outcome::Throttled { retry_after }, latency);
            anyhow::bail!("{venue} throttled ({status}) on {url}");
        }

        if !status.is_success() {
            self.safety.record(permit, Outcome::Failure, latency);
            anyhow::bail!("{venue} returned {status} for {url}");
        }

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                self.safety
                    .record(permit, Outcome::Failure, latency);
                return Err(err).with_context(|| format!("parsing body of {url}"));
            }
        };

        self.safety.record(permit, Outcome::Success, latency);
        debug!(venue = %venue, url, latency_ms = latency.as_millis() as u64, "warm fetch ok");
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Klines
    // -------------------------------------------------------------------------

    /// OHLCV history for `symbol` at `timeframe`, oldest first.
    #[instrument(skip(self), name = "warm::fetch_klines")]
    pub async fn fetch_klines(
        &self,
        venue: Venue,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Bar>> {
        match venue {
            Venue::Binance => self.binance_klines(symbol, timeframe, limit).await,
            Venue::Kraken => self.kraken_klines(symbol, timeframe, limit).await,
            Venue::Okx => self.okx_klines(symbol, timeframe, limit).await,
            other => anyhow::bail!("{other} does not serve klines"),
        }
    }

    async fn binance_klines(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Bar>> {
        let interval = match timeframe {
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::H12 => "12h",
            Timeframe::H24 => "1d",
            Timeframe::D7 => "1w",
        };
        let url = format!(
            "https://api.binance.com/api/v3/klines?symbol={}&interval={}&limit={}",
            venue_pair(Venue::Binance, symbol),
            interval,
            limit
        );
        let body = self.get_json(Venue::Binance, &url, 2, false).await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 6 {
                warn!(elements = arr.len(), "skipping malformed kline entry");
                continue;
            }
            bars.push(Bar {
                ts: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
            });
        }
        Ok(bars)
    }

    async fn kraken_klines(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Bar>> {
        let interval_min = timeframe.duration_ms() / 60_000;
        let pair = venue_pair(Venue::Kraken, symbol);
        let url = format!(
            "https://api.kraken.com/0/public/OHLC?pair={pair}&interval={interval_min}"
        );
        let body = self.get_json(Venue::Kraken, &url, 1, false).await?;

        let result = body["result"]
            .as_object()
            .context("kraken OHLC response missing result")?;
        // The result object holds the pair key plus `last`; take the array.
        let series = result
            .iter()
            .find_map(|(k, v)| (k != "last").then_some(v))
            .and_then(|v| v.as_array())
            .context("kraken OHLC result has no series")?;

        let mut bars: Vec<Bar> = series
            .iter()
            .filter_map(|entry| {
                let arr = entry.as_array()?;
                Some(Bar {
                    ts: arr.first()?.as_i64()? * 1000,
                    open: arr.get(1)?.as_str()?.parse().ok()?,
                    high: arr.get(2)?.as_str()?.parse().ok()?,
                    low: arr.get(3)?.as_str()?.parse().ok()?,
                    close: arr.get(4)?.as_str()?.parse().ok()?,
                    volume: arr.get(6)?.as_str()?.parse().ok()?,
                })
            })
            .collect();

        let keep = bars.len().saturating_sub(limit as usize);
        bars.drain(..keep);
        Ok(bars)
    }

    async fn okx_klines(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Bar>> {
        let bar = match timeframe {
            Timeframe::H1 => "1H",
            Timeframe::H4 => "4H",
            Timeframe::H12 => "12H",
            Timeframe::H24 => "1D",
            Timeframe::D7 => "1W",
        };
        let url = format!(
            "https://www.okx.com/api/v5/market/candles?instId={}&bar={}&limit={}",
            venue_pair(Venue::Okx, symbol),
            bar,
            limit
        );
        let body = self.get_json(Venue::Okx, &url, 1, false).await?;

        let data = body["data"].as_array().context("okx candles missing data")?;
        // OKX returns newest first.
        let mut bars: Vec<Bar> = data
            .iter()
            .filter_map(|entry| {
                let arr = entry.as_array()?;
                Some(Bar {
                    ts: arr.first()?.as_str()?.parse().ok()?,
                    open: arr.get(1)?.as_str()?.parse().ok()?,
                    high: arr.get(2)?.as_str()?.parse().ok()?,
                    low: arr.get(3)?.as_str()?.parse().ok()?,
                    close: arr.get(4)?.as_str()?.parse().ok()?,
                    volume: arr.get(5)?.as_str()?.parse().ok()?,
                })
            })
            .collect();
        bars.reverse();
        Ok(bars)
    }

    // -------------------------------------------------------------------------
    // Spot prices (aggregators allowed)
    // -------------------------------------------------------------------------

    /// Latest spot price for `symbol` from one source.
    #[instrument(skip(self), name = "warm::fetch_spot_price")]
    pub async fn fetch_spot_price(&self, venue: Venue, symbol: &Symbol) -> Result<f64> {
        match venue {
            Venue::Coingecko => {
                let id = coingecko_id(&symbol.base);
                let url = format!(
                    "https://api.coingecko.com/api/v3/simple/price?ids={id}&vs_currencies=usd"
                );
                let body = self.get_json(venue, &url, 1, false).await?;
                body[&id]["usd"]
                    .as_f64()
                    .with_context(|| format!("coingecko missing usd price for {id}"))
            }
            Venue::Coinpaprika => {
                let id = coinpaprika_id(&symbol.base);
                let url = format!("https://api.coinpaprika.com/v1/tickers/{id}");
                let body = self.get_json(venue, &url, 1, false).await?;
                body["quotes"]["USD"]["price"]
                    .as_f64()
                    .with_context(|| format!("coinpaprika missing USD price for {id}"))
            }
            Venue::Binance => {
                let url = format!(
                    "https://api.binance.com/api/v3/ticker/price?symbol={}",
                    venue_pair(Venue::Binance, symbol)
                );
                let body = self.get_json(venue, &url, 2, false).await?;
                body["price"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .context("binance ticker missing price")
            }
            other => anyhow::bail!("{other} does not serve spot prices"),
        }
    }

    /// 24h quote volume in USD for ADV ranking.
    #[instrument(skip(self), name = "warm::fetch_volume_24h")]
    pub async fn fetch_volume_24h(&self, venue: Venue, symbol: &Symbol) -> Result<f64> {
        match venue {
            Venue::Binance => {
                let url = format!(
                    "https://api.binance.com/api/v3/ticker/24hr?symbol={}",
                    venue_pair(Venue::Binance, symbol)
                );
                let body = self.get_json(venue, &url, 2, false).await?;
                body["quoteVolume"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .context("binance 24hr ticker missing quoteVolume")
            }
            other => anyhow::bail!("{other} does not serve 24h volume"),
        }
    }

    // -------------------------------------------------------------------------
    // Orderbooks (exchange-native only; facade enforces the allow-list)
    // -------------------------------------------------------------------------

    /// Raw book levels (bids best-first, asks best-first).
    #[instrument(skip(self), name = "warm::fetch_book")]
    pub async fn fetch_book(
        &self,
        venue: Venue,
        symbol: &Symbol,
    ) -> Result<(Vec<BookLevel>, Vec<BookLevel>)> {
        match venue {
            Venue::Binance => {
                let url = format!(
                    "https://api.binance.com/api/v3/depth?symbol={}&limit=50",
                    venue_pair(Venue::Binance, symbol)
                );
                let body = self.get_json(venue, &url, 5, true).await?;
                Ok((
                    parse_levels(&body["bids"], "bids")?,
                    parse_levels(&body["asks"], "asks")?,
                ))
            }
            Venue::Kraken => {
                let pair = venue_pair(Venue::Kraken, symbol);
                let url =
                    format!("https://api.kraken.com/0/public/Depth?pair={pair}&count=50");
                let body = self.get_json(venue, &url, 1, true).await?;
                let book = body["result"]
                    .as_object()
                    .and_then(|o| o.values().next())
                    .context("kraken depth response empty")?;
                Ok((
                    parse_levels(&book["bids"], "bids")?,
                    parse_levels(&book["asks"], "asks")?,
                ))
            }
            Venue::Okx => {
                let url = format!(
                    "https://www.okx.com/api/v5/market/books?instId={}&sz=50",
                    venue_pair(Venue::Okx, symbol)
                );
                let body = self.get_json(venue, &url, 1, true).await?;
                let book = body["data"]
                    .as_array()
                    .and_then(|a| a.first())
                    .context("okx books response empty")?;
                Ok((
                    parse_levels(&book["bids"], "bids")?,
                    parse_levels(&book["asks"], "asks")?,
                ))
            }
            other => anyhow::bail!("{other} does not serve orderbooks"),
        }
    }

    // -------------------------------------------------------------------------
    // Derivatives (funding, open interest)
    // -------------------------------------------------------------------------

    /// Latest funding rate (decimal per interval) and the 24h perp volume
    /// used as the median weight.
    #[instrument(skip(self), name = "warm::fetch_funding")]
    pub async fn fetch_funding(&self, venue: Venue, symbol: &Symbol) -> Result<(f64, f64)> {
        match venue {
            Venue::Binance => {
                let pair = venue_pair(Venue::Binance, symbol);
                let url = format!(
                    "https://fapi.binance.com/fapi/v1/premiumIndex?symbol={pair}"
                );
                let body = self.get_json(venue, &url, 1, false).await?;
                let rate = body["lastFundingRate"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .context("binance premiumIndex missing lastFundingRate")?;

                let vol_url = format!(
                    "https://fapi.binance.com/fapi/v1/ticker/24hr?symbol={pair}"
                );
                let vol_body = self.get_json(venue, &vol_url, 1, false).await?;
                let volume = vol_body["quoteVolume"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                Ok((rate, volume))
            }
            Venue::Okx => {
                let inst = format!("{}-USDT-SWAP", symbol.base);
                let url = format!(
                    "https://www.okx.com/api/v5/public/funding-rate?instId={inst}"
                );
                let body = self.get_json(venue, &url, 1, false).await?;
                let rate = body["data"]
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(|d| d["fundingRate"].as_str())
                    .and_then(|s| s.parse().ok())
                    .context("okx funding response missing fundingRate")?;
                Ok((rate, 0.0))
            }
            other => anyhow::bail!("{other} does not serve funding"),
        }
    }

    /// Spot/perp basis as a fraction, from the mark/index premium.
    #[instrument(skip(self), name = "warm::fetch_basis")]
    pub async fn fetch_basis(&self, venue: Venue, symbol: &Symbol) -> Result<f64> {
        match venue {
            Venue::Binance => {
                let url = format!(
                    "https://fapi.binance.com/fapi/v1/premiumIndex?symbol={}",
                    venue_pair(Venue::Binance, symbol)
                );
                let body = self.get_json(venue, &url, 1, false).await?;
                let mark: f64 = body["markPrice"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .context("binance premiumIndex missing markPrice")?;
                let index: f64 = body["indexPrice"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .context("binance premiumIndex missing indexPrice")?;
                if index <= 0.0 {
                    anyhow::bail!("binance premiumIndex has non-positive indexPrice");
                }
                Ok((mark - index) / index)
            }
            other => anyhow::bail!("{other} does not serve basis"),
        }
    }

    /// Current open interest in contracts.
    #[instrument(skip(self), name = "warm::fetch_open_interest")]
    pub async fn fetch_open_interest(&self, venue: Venue, symbol: &Symbol) -> Result<f64> {
        match venue {
            Venue::Binance => {
                let url = format!(
                    "https://fapi.binance.com/fapi/v1/openInterest?symbol={}",
                    venue_pair(Venue::Binance, symbol)
                );
                let body = self.get_json(venue, &url, 1, false).await?;
                body["openInterest"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .context("binance openInterest missing value")
            }
            other => anyhow::bail!("{other} does not serve open interest"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pair and id mapping
// ---------------------------------------------------------------------------

/// The venue-local market id for a USD-quoted symbol. Binance and OKX quote
/// "USD" books in USDT; Kraken spells BTC as XBT.
pub fn venue_pair(venue: Venue, symbol: &Symbol) -> String {
    match venue {
        Venue::Binance => format!("{}USDT", symbol.base),
        Venue::Okx => format!("{}-USDT", symbol.base),
        Venue::Kraken => {
            let base = if symbol.base == "BTC" { "XBT" } else { &symbol.base };
            format!("{base}USD")
        }
        Venue::Coinbase => format!("{}-USD", symbol.base),
        Venue::Coingecko | Venue::Coinpaprika => symbol.pair(),
    }
}

fn coingecko_id(base: &str) -> String {
    match base {
        "BTC" => "bitcoin".to_string(),
        "ETH" => "ethereum".to_string(),
        "SOL" => "solana".to_string(),
        "XRP" => "ripple".to_string(),
        "ADA" => "cardano".to_string(),
        other => other.to_lowercase(),
    }
}

fn coinpaprika_id(base: &str) -> String {
    match base {
        "BTC" => "btc-bitcoin".to_string(),
        "ETH" => "eth-ethereum".to_string(),
        "SOL" => "sol-solana".to_string(),
        "XRP" => "xrp-xrp".to_string(),
        "ADA" => "ada-cardano".to_string(),
        other => format!("{}-{}", other.to_lowercase(), other.to_lowercase()),
    }
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

/// Parse an array of `[price, qty, ...]` levels (strings or numbers).
fn parse_levels(side: &serde_json::Value, name: &str) -> Result<Vec<BookLevel>> {
    side.as_array()
        .with_context(|| format!("missing field {name}"))?
        .iter()
        .map(|level| {
            let arr = level
                .as_array()
                .with_context(|| format!("{name} level is not an array"))?;
            Ok(BookLevel {
                price: parse_str_f64(arr.first().context("missing price")?)?,
                qty: parse_str_f64(arr.get(1).context("missing qty")?)?,
            })
        })
        .collect()
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sym(base: &str) -> Symbol {
        Symbol::usd(Venue::Kraken, base)
    }

    #[test]
    fn venue_pair_mapping() {
        assert_eq!(venue_pair(Venue::Binance, &sym("BTC")), "BTCUSDT");
        assert_eq!(venue_pair(Venue::Okx, &sym("SOL")), "SOL-USDT");
        assert_eq!(venue_pair(Venue::Kraken, &sym("BTC")), "XBTUSD");
        assert_eq!(venue_pair(Venue::Kraken, &sym("ETH")), "ETHUSD");
        assert_eq!(venue_pair(Venue::Coinbase, &sym("BTC")), "BTC-USD");
    }

    #[test]
    fn aggregator_id_mapping() {
        assert_eq!(coingecko_id("BTC"), "bitcoin");
        assert_eq!(coingecko_id("DOGE"), "doge");
        assert_eq!(coinpaprika_id("ETH"), "eth-ethereum");
    }

    #[test]
    fn parse_levels_accepts_strings_and_numbers() {
        let side = serde_json::json!([["100.5", "2.0"], [101.0, 3.0]]);
        let levels = parse_levels(&side, "bids").unwrap();
        assert_eq!(levels.len(), 2);
        assert!((levels[0].price - 100.5).abs() < f64::EPSILON);
        assert!((levels[1].qty - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_str_f64_both_forms() {
        assert!((parse_str_f64(&serde_json::json!("1.5")).unwrap() - 1.5).abs() < 1e-12);
        assert!((parse_str_f64(&serde_json::json!(2.5)).unwrap() - 2.5).abs() < 1e-12);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
    }
}
