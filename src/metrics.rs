// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "price ticks received").unwrap());

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "price ticks per symbol"),
        &["symbol", "exchange"],
    )
    .unwrap()
});

pub static STALE_TICKS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("stale_ticks_total", "ticks dropped as older than the last applied").unwrap()
});

pub static SLOT_TICKS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("slot_ticks_dropped_total", "ticks dropped because a slot queue was full"),
        &["symbol", "exchange"],
    )
    .unwrap()
});

pub static FEED_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("feed_errors_total", "quote polling failures"), &["symbol"]).unwrap()
});

// -------- Order lifecycle --------
pub static ORDERS_PLACED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_placed_total", "orders accepted").unwrap());

pub static ORDERS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_rejected_total", "orders rejected"), &["reason"]).unwrap()
});

pub static ORDERS_CLOSED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_closed_total", "orders reaching a terminal status"),
        &["status"],
    )
    .unwrap()
});

pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("trades_total", "trades executed"), &["side"]).unwrap()
});

pub static BRACKET_EXITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("bracket_exits_total", "bracket exits"), &["reason"]).unwrap()
});

pub static LOST_RACES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("execution_lost_races_total", "executions aborted because the order left ACTIVE")
        .unwrap()
});

// -------- Client API --------
pub static API_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("api_requests_total", "api requests"), &["route", "status"]).unwrap()
});

// -------- Ledger --------
pub static CASH_AVAILABLE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("cash_available", "cash not reserved by resting orders").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_unrealized", "unrealized PnL at the last projection").unwrap());

pub static POSITION_QTY: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("position_qty", "net qty per instrument"), &["symbol", "exchange"])
        .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_feed_mode", "feed mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (labels: symbol, exchange)"),
        &["symbol", "exchange"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; a second init is a harmless AlreadyReg
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(STALE_TICKS.clone())),
        REGISTRY.register(Box::new(SLOT_TICKS_DROPPED.clone())),
        REGISTRY.register(Box::new(FEED_ERRORS.clone())),
        REGISTRY.register(Box::new(ORDERS_PLACED.clone())),
        REGISTRY.register(Box::new(ORDERS_REJECTED.clone())),
        REGISTRY.register(Box::new(ORDERS_CLOSED.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(BRACKET_EXITS.clone())),
        REGISTRY.register(Box::new(LOST_RACES.clone())),
        REGISTRY.register(Box::new(API_REQUESTS.clone())),
        REGISTRY.register(Box::new(CASH_AVAILABLE.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(POSITION_QTY.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, %addr, "metrics bind failed, metrics disabled");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}
