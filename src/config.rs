// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : paper_desk: paper-trading order & portfolio engine in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Polls (or simulates) quotes for NSE/BSE symbols, rests limit
          orders with take-profit / stop-loss brackets, executes them
          against ticks, keeps cash/positions/PnL in a journaled ledger,
          and serves orders, portfolio and quotes over HTTP.
=============================================================================
*/
use std::env;
use std::path::PathBuf;

use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;

use crate::domain::{Exchange, PositionKey};

/// Command-line overrides; everything else comes from the environment / `.env`.
#[derive(Parser, Debug, Default)]
#[command(name = "paper_desk", version, about = "Paper-trading order & portfolio engine")]
pub struct Cli {
    /// Load this file instead of ./.env
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    #[arg(long)]
    pub api_port: Option<u16>,
    #[arg(long)]
    pub metrics_port: Option<u16>,
}

/// Source of quotes for the bracket evaluator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Http,
}

impl FeedMode {
    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => FeedMode::Mock,
            "http" => FeedMode::Http,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Http => "http",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbols: Vec<PositionKey>,

    // feed
    pub feed_mode: FeedMode,
    pub quote_url: String, // template, `{symbol}` / `{exchange}` substituted
    pub feed_poll_ms: u64,
    pub mock_start_px: Decimal,

    // ledger
    pub starting_cash: Decimal,
    pub ledger_file: Option<String>,

    // lifecycle
    pub order_ttl_secs: u64, // 0 = entry orders never expire
    pub expiry_sweep_secs: u64,

    // ports
    pub api_port: u16,
    pub metrics_port: u16,
}

#[derive(Clone, Debug)]
pub struct Limits {
    pub max_bracket_pct: Decimal,
    pub max_order_qty: u64,
    pub max_notional: Decimal,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_bracket_pct: Decimal::ONE_HUNDRED,
            max_order_qty: 1_000_000,
            max_notional: Decimal::from(10_000_000u64),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// `SYMBOLS=RELIANCE:NSE,TCS:BSE`; exchange defaults to NSE when omitted.
pub fn parse_symbols(raw: &str) -> Vec<PositionKey> {
    let mut out: Vec<PositionKey> = raw
        .split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .filter_map(|x| match x.split_once(':') {
            Some((sym, exch)) => Exchange::parse(exch).map(|e| PositionKey::new(sym.trim(), e)),
            None => Some(PositionKey::new(x, Exchange::Nse)),
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn load(cli: &Cli) -> (Args, Limits) {
    match &cli.env_file {
        Some(path) => {
            if let Err(e) = dotenvy::from_path(path) {
                tracing::warn!(?e, path = %path.display(), "env file not loaded");
            }
        }
        None => {
            let _ = dotenv();
        }
    }

    // ===== Basic =====
    let symbols = env::var("SYMBOLS")
        .ok()
        .map(|s| parse_symbols(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| parse_symbols("RELIANCE:NSE,TCS:NSE"));

    // ===== Feed =====
    let feed_mode = FeedMode::from_env("FEED_MODE", FeedMode::Mock);
    let quote_url = env::var("QUOTE_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:7070/quote/{symbol}/{exchange}".to_string());
    let feed_poll_ms = env_or("FEED_POLL_MS", 5_000u64).max(10);
    let mock_start_px = env_or("MOCK_START_PX", Decimal::ONE_HUNDRED);

    // ===== Ledger =====
    let starting_cash = env_or("STARTING_CASH", Decimal::from(100_000u64));
    let ledger_file = env::var("LEDGER_FILE").ok().filter(|s| !s.trim().is_empty());

    let args = Args {
        symbols,
        feed_mode,
        quote_url,
        feed_poll_ms,
        mock_start_px,
        starting_cash,
        ledger_file,
        order_ttl_secs: env_or("ORDER_TTL_SECS", 86_400u64),
        expiry_sweep_secs: env_or("EXPIRY_SWEEP_SECS", 5u64).max(1),
        api_port: cli.api_port.unwrap_or_else(|| env_or("API_PORT", 8080u16)),
        metrics_port: cli.metrics_port.unwrap_or_else(|| env_or("METRICS_PORT", 9898u16)),
    };

    // ===== Limits =====
    let defaults = Limits::default();
    let limits = Limits {
        max_bracket_pct: env_or("MAX_BRACKET_PCT", defaults.max_bracket_pct),
        max_order_qty: env_or("MAX_ORDER_QTY", defaults.max_order_qty),
        max_notional: env_or("MAX_NOTIONAL", defaults.max_notional),
    };
    (args, limits)
}
