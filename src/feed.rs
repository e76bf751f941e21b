// ===============================
// src/feed.rs
// ===============================
//
// Price feed adapters:
// - run_mock : random walk per symbol, one tick per poll interval carrying the
//              interval's high/low
// - run_http : polls a quote endpoint (QUOTE_URL template) at FEED_POLL_MS
//
// Both record into the shared PriceBoard before publishing on the tick bus, so
// `/api/stocks` and the portfolio see the same price the evaluator acts on.
//
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::domain::{PositionKey, Quote, Tick};
use crate::metrics::{FEED_ERRORS, TICKS};

fn now_ns() -> i128 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128
}

/// Latest quote per symbol+exchange.
#[derive(Default)]
pub struct PriceBoard {
    quotes: RwLock<HashMap<PositionKey, Quote>>,
}

impl PriceBoard {
    pub fn new() -> Self { Self::default() }

    /// Folds a tick into the day's quote. Returns false (and changes nothing) for a tick
    /// older than the quote already held.
    pub fn record(&self, tick: &Tick) -> bool {
        let mut quotes = self.quotes.write().unwrap_or_else(|e| e.into_inner());
        let (open, high, low) = match quotes.get(&tick.key) {
            Some(q) if tick.ts_ns <= q.ts_ns => return false,
            Some(q) => (q.day_open, q.day_high.max(tick.range_high()), q.day_low.min(tick.range_low())),
            None => (tick.price, tick.range_high(), tick.range_low()),
        };
        quotes.insert(tick.key.clone(), make_quote(&tick.key, tick.price, open, high, low, tick.ts_ns));
        true
    }

    /// Stores a quote as reported by an upstream that tracks the day itself.
    pub fn put(&self, quote: Quote) -> bool {
        let key = PositionKey::new(quote.symbol.clone(), quote.exchange);
        let mut quotes = self.quotes.write().unwrap_or_else(|e| e.into_inner());
        if matches!(quotes.get(&key), Some(q) if quote.ts_ns <= q.ts_ns) {
            return false;
        }
        quotes.insert(key, quote);
        true
    }

    pub fn latest(&self, key: &PositionKey) -> Option<Quote> {
        self.quotes.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    pub fn price(&self, key: &PositionKey) -> Option<Decimal> {
        self.latest(key).map(|q| q.current_price)
    }

    pub fn all(&self) -> Vec<Quote> {
        let mut out: Vec<Quote> = self.quotes.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect();
        out.sort_by(|a, b| (&a.symbol, a.exchange).cmp(&(&b.symbol, b.exchange)));
        out
    }
}

fn make_quote(key: &PositionKey, px: Decimal, open: Decimal, high: Decimal, low: Decimal, ts_ns: i128) -> Quote {
    let change = px - open;
    let change_percent = if open.is_zero() {
        Decimal::ZERO
    } else {
        (change / open * Decimal::ONE_HUNDRED).round_dp(4)
    };
    Quote {
        symbol: key.symbol.clone(),
        exchange: key.exchange,
        current_price: px,
        change,
        change_percent,
        day_open: open,
        day_high: high,
        day_low: low,
        ts_ns,
    }
}

fn publish(md_tx: &broadcast::Sender<Tick>, board: &PriceBoard, tick: Tick) {
    if board.record(&tick) {
        TICKS.inc();
        // no receivers yet is fine, the board still has the quote
        let _ = md_tx.send(tick);
    }
}

/// Random walk in 0.05 steps. Each emitted tick summarizes a few sub-steps so the
/// evaluator sees a realistic intra-interval range.
pub async fn run_mock(
    md_tx: broadcast::Sender<Tick>,
    board: Arc<PriceBoard>,
    key: PositionKey,
    start_px: Decimal,
    interval_ms: u64,
) {
    let step = Decimal::new(5, 2);
    let floor = Decimal::ONE;
    let mut px = start_px.max(floor);
    info!(%key, %px, interval_ms, "mock feed started");
    loop {
        let (mut high, mut low) = (px, px);
        {
            // keep ThreadRng out of the .await below
            let mut rng = rand::thread_rng();
            for _ in 0..4 {
                px = (px + step * Decimal::from(rng.gen_range(-3..=3))).max(floor);
                high = high.max(px);
                low = low.min(px);
            }
        }
        let tick = Tick { ts_ns: now_ns(), key: key.clone(), price: px, high: Some(high), low: Some(low) };
        publish(&md_tx, &board, tick);
        sleep(Duration::from_millis(interval_ms)).await;
    }
}

/// Upstream quote body. Only the price is required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteQuote {
    #[serde(alias = "price", alias = "lastPrice")]
    current_price: Decimal,
    #[serde(default)]
    day_open: Option<Decimal>,
    #[serde(default)]
    day_high: Option<Decimal>,
    #[serde(default)]
    day_low: Option<Decimal>,
}

async fn fetch(client: &reqwest::Client, url: &str) -> reqwest::Result<RemoteQuote> {
    client.get(url).send().await?.error_for_status()?.json::<RemoteQuote>().await
}

pub fn quote_url(template: &str, key: &PositionKey) -> String {
    template.replace("{symbol}", &key.symbol).replace("{exchange}", key.exchange.as_str())
}

fn to_quote(key: &PositionKey, rq: RemoteQuote, ts_ns: i128) -> Option<Quote> {
    let px = rq.current_price;
    if px <= Decimal::ZERO {
        return None;
    }
    let open = rq.day_open.filter(|o| *o > Decimal::ZERO).unwrap_or(px);
    let high = rq.day_high.unwrap_or(px).max(px);
    let low = rq.day_low.filter(|l| *l > Decimal::ZERO).unwrap_or(px).min(px);
    Some(make_quote(key, px, open, high, low, ts_ns))
}

/// Polls the quote endpoint. Upstream day high/low are kept on the board but not put on
/// the tick: they span the whole session, not the last interval.
pub async fn run_http(
    md_tx: broadcast::Sender<Tick>,
    board: Arc<PriceBoard>,
    key: PositionKey,
    url_template: String,
    poll_ms: u64,
) {
    let url = quote_url(&url_template, &key);
    let client = match reqwest::Client::builder().timeout(Duration::from_millis(poll_ms.max(1_000))).build() {
        Ok(c) => c,
        Err(e) => {
            error!(?e, "http client build failed, feed disabled");
            return;
        }
    };
    info!(%key, %url, poll_ms, "http feed started");

    let mut attempt: u32 = 0;
    loop {
        match fetch(&client, &url).await {
            Ok(rq) => {
                attempt = 0;
                let ts_ns = now_ns();
                match to_quote(&key, rq, ts_ns) {
                    Some(q) => {
                        let tick = Tick { ts_ns, key: key.clone(), price: q.current_price, high: None, low: None };
                        if board.put(q) {
                            TICKS.inc();
                            let _ = md_tx.send(tick);
                        }
                    }
                    None => warn!(%key, "quote without a usable price"),
                }
                sleep(Duration::from_millis(poll_ms)).await;
            }
            Err(e) => {
                FEED_ERRORS.with_label_values(&[&key.symbol]).inc();
                // Exponential backoff + jitter, never faster than the poll cadence
                attempt = attempt.saturating_add(1);
                let shift = attempt.min(6);
                let base_ms = 500u64.saturating_mul(1u64 << shift).max(poll_ms);
                let jitter = rand::thread_rng().gen_range(0..=250);
                warn!(%key, error = %e, attempt, retry_ms = base_ms + jitter, "quote poll failed");
                sleep(Duration::from_millis(base_ms + jitter)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Exchange;
    use rust_decimal_macros::dec;

    fn key() -> PositionKey { PositionKey::new("TCS", Exchange::Bse) }

    fn tick(ts: i128, px: Decimal) -> Tick { Tick { ts_ns: ts, key: key(), price: px, high: None, low: None } }

    #[test]
    fn board_tracks_the_day_and_ignores_older_ticks() {
        let board = PriceBoard::new();
        assert!(board.record(&tick(1, dec!(200))));
        assert!(board.record(&Tick { high: Some(dec!(212)), low: Some(dec!(195)), ..tick(2, dec!(210)) }));
        assert!(!board.record(&tick(2, dec!(1))));
        assert!(!board.record(&tick(1, dec!(1))));

        let q = board.latest(&key()).unwrap();
        assert_eq!(q.current_price, dec!(210));
        assert_eq!(q.day_open, dec!(200));
        assert_eq!(q.day_high, dec!(212));
        assert_eq!(q.day_low, dec!(195));
        assert_eq!(q.change, dec!(10));
        assert_eq!(q.change_percent, dec!(5));
        assert_eq!(board.price(&PositionKey::new("TCS", Exchange::Nse)), None);
    }

    #[test]
    fn remote_quote_accepts_price_aliases() {
        let rq: RemoteQuote = serde_json::from_str(r#"{"price": 101.5, "dayOpen": 100}"#).unwrap();
        let q = to_quote(&key(), rq, 7).unwrap();
        assert_eq!(q.change, dec!(1.5));
        assert_eq!(q.day_high, dec!(101.5));
        assert_eq!(q.day_low, dec!(101.5));

        let zero: RemoteQuote = serde_json::from_str(r#"{"currentPrice": "0"}"#).unwrap();
        assert!(to_quote(&key(), zero, 8).is_none());
    }

    #[test]
    fn url_template_is_filled() {
        assert_eq!(quote_url("http://q/{symbol}/{exchange}", &key()), "http://q/TCS/BSE");
    }

    #[tokio::test]
    async fn mock_feed_publishes_ranged_ticks() {
        let (tx, mut rx) = broadcast::channel(16);
        let board = Arc::new(PriceBoard::new());
        let task = tokio::spawn(run_mock(tx, board.clone(), key(), dec!(100), 1));
        let t = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        task.abort();
        assert_eq!(t.key, key());
        assert!(t.range_low() <= t.price && t.price <= t.range_high());
        assert!(board.latest(&key()).is_some());
    }
}
