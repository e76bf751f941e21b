// ===============================
// src/main.rs
// ===============================
/*
 # orders & portfolio
 curl -s -XPOST localhost:8080/api/orders -d '{"symbol":"RELIANCE","exchange":"NSE","side":"BUY",
   "quantity":10,"limitPrice":100,"takeProfit":{"type":"PERCENTAGE","value":5}}'
 curl -s localhost:8080/api/orders/active
 curl -s localhost:8080/api/portfolio

 # what is configured / moving
 curl -s localhost:9898/metrics | egrep '^config_(feed_mode|symbol)'
 curl -s localhost:9898/metrics | grep '^ticks_total_by_symbol'
*/
/*
=============================================================================
Project : paper_desk: paper-trading order & portfolio engine in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Polls (or simulates) quotes for NSE/BSE symbols, rests limit
          orders with take-profit / stop-loss brackets, executes them
          against ticks, keeps cash/positions/PnL in a journaled ledger,
          and serves orders, portfolio and quotes over HTTP.
=============================================================================
*/
mod api;
mod book;
mod bracket;
mod config;
mod domain;
mod error;
mod execution;
mod feed;
mod metrics;
mod portfolio;
mod positions;
mod posttrade;
mod recorder;
mod risk;
mod store;

use std::sync::Arc;

use clap::Parser;
use tokio::{
    select,
    sync::{broadcast, mpsc},
    time::{interval, Duration},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::domain::{Event, Tick};
use crate::store::{LedgerStore, MemoryStore, OrderFilter};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config & limits ----
    let cli = config::Cli::parse();
    let (args, limits) = config::load(&cli);

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    info!(
        feed_mode = args.feed_mode.as_str(),
        symbols = ?args.symbols.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        starting_cash = %args.starting_cash,
        ledger_file = ?args.ledger_file,
        order_ttl_secs = args.order_ttl_secs,
        api_port = args.api_port,
        limits = ?limits,
        "startup config"
    );
    metrics::CONFIG_FEED_MODE.with_label_values(&[args.feed_mode.as_str()]).set(1);
    for k in &args.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[&k.symbol, k.exchange.as_str()]).set(1);
    }

    // ---- Ledger (replay journal, then mirror every commit) ----
    let replay = match args.ledger_file.as_deref().map(recorder::load).transpose() {
        Ok(events) => events.unwrap_or_default(),
        Err(e) => {
            // starting empty would append a second history onto the file
            error!(error = %e, "ledger journal unreadable, refusing to start");
            return;
        }
    };
    let replayed = replay.len();
    let (journal_tx, mut journal_rx) = mpsc::unbounded_channel::<Event>();
    let _ = journal_tx.send(Event::Note(format!("session start, {replayed} events replayed")));
    let store = Arc::new(MemoryStore::restore(args.starting_cash, replay).with_journal(journal_tx));

    // Fan-out journal: store -> (recorder, posttrade)
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let (post_tx, post_rx) = mpsc::channel::<Event>(8192);
    let recording = args.ledger_file.is_some();
    if let Some(path) = args.ledger_file.clone() {
        tokio::spawn(recorder::run(rec_rx, path));
    }
    tokio::spawn(async move {
        let mut recording = recording;
        while let Some(ev) = journal_rx.recv().await {
            if recording && rec_tx.send(ev.clone()).await.is_err() {
                // from here on the file no longer mirrors the ledger
                error!("recorder stopped, ledger journal no longer written");
                recording = false;
            }
            let _ = post_tx.send(ev).await;
        }
    });
    tokio::spawn(posttrade::run(post_rx));

    // ---- Evaluator + order book ----
    let evaluator = Arc::new(bracket::BracketEvaluator::new(store.clone()));
    let book = Arc::new(book::OrderBook::new(store.clone(), evaluator.clone(), limits));
    let resumed = book.resume();
    info!(replayed, resumed, "ledger ready");

    // ---- Tick bus + feeds ----
    let (md_tx, _md_rx) = broadcast::channel::<Tick>(4096);
    let board = Arc::new(feed::PriceBoard::new());
    tokio::spawn(bracket::run(evaluator.clone(), md_tx.subscribe()));

    for key in args.symbols.iter().cloned() {
        let tx = md_tx.clone();
        let board = board.clone();
        match args.feed_mode {
            config::FeedMode::Mock => {
                tokio::spawn(feed::run_mock(tx, board, key, args.mock_start_px, args.feed_poll_ms));
            }
            config::FeedMode::Http => {
                tokio::spawn(feed::run_http(tx, board, key, args.quote_url.clone(), args.feed_poll_ms));
            }
        }
    }

    // ---- Expiry sweeper ----
    if args.order_ttl_secs > 0 {
        let book = book.clone();
        let ttl = chrono::Duration::seconds(args.order_ttl_secs as i64);
        let mut sweep = interval(Duration::from_secs(args.expiry_sweep_secs));
        tokio::spawn(async move {
            loop {
                sweep.tick().await;
                let expired = book.expire_due(chrono::Utc::now(), ttl);
                if !expired.is_empty() {
                    info!(count = expired.len(), "expiry sweep");
                }
            }
        });
    }

    // ---- Client API ----
    let state = Arc::new(api::AppState { book: book.clone(), store: store.clone(), board: board.clone() });
    tokio::spawn(api::serve(state, args.api_port));

    // ---- Heartbeat ----
    let mut md_rx_metrics = md_tx.subscribe();
    let mut tick_count: u64 = 0;
    let mut beat = interval(Duration::from_secs(5));
    loop {
        select! {
            Ok(_) = md_rx_metrics.recv() => {
                tick_count += 1;
            },
            _ = beat.tick() => {
                let view = portfolio::project(&store.snapshot(), |k| board.price(k));
                portfolio::publish_gauges(&view);
                info!(
                    ticks = tick_count,
                    open_orders = store.list_orders(&OrderFilter::open()).len(),
                    available_cash = %view.available_cash,
                    total_value = %view.total_value,
                    total_pnl = %view.total_pnl,
                    "heartbeat"
                );
                tick_count = 0;
            }
        }
    }
}
