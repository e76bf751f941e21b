// ===============================
// src/domain.rs
// ===============================
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type OrderId = u64;
pub type TradeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange { Nse, Bse }

impl Exchange {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NSE" => Some(Exchange::Nse),
            "BSE" => Some(Exchange::Bse),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str { match self { Exchange::Nse => "NSE", Exchange::Bse => "BSE" } }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }

impl Side {
    pub fn sign(&self) -> i64 { match self { Side::Buy => 1, Side::Sell => -1 } }
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

/// Instrument key: positions, price slots and quotes are all keyed by symbol+exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey { pub symbol: String, pub exchange: Exchange }

impl PositionKey {
    pub fn new(symbol: impl Into<String>, exchange: Exchange) -> Self {
        Self { symbol: symbol.into().to_ascii_uppercase(), exchange }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}:{}", self.symbol, self.exchange) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BracketKind { Percentage, Absolute }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bracket {
    #[serde(rename = "type")]
    pub kind: BracketKind,
    pub value: Decimal,
}

impl Bracket {
    /// Offset from the entry price, always non-negative. `None` when it does not fit a
    /// `Decimal`.
    pub fn offset(&self, entry: Decimal) -> Option<Decimal> {
        match self.kind {
            BracketKind::Percentage => entry.checked_mul(self.value)?.checked_div(Decimal::ONE_HUNDRED),
            BracketKind::Absolute => Some(self.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus { Pending, Active, Executed, Cancelled, Expired }

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Executed | OrderStatus::Cancelled | OrderStatus::Expired)
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Active => "ACTIVE",
            OrderStatus::Executed => "EXECUTED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason { TakeProfit, StopLoss }

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self { ExitReason::TakeProfit => "take_profit", ExitReason::StopLoss => "stop_loss" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub quantity: u64,
    pub limit_price: Decimal,
    pub take_profit: Option<Bracket>,
    pub stop_loss: Option<Bracket>,
    pub status: OrderStatus,
    /// Fill price of the entry leg, set once the order has traded.
    pub entry_price: Option<Decimal>,
    pub executed_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Order {
    pub fn key(&self) -> PositionKey { PositionKey::new(self.symbol.clone(), self.exchange) }
    pub fn has_bracket(&self) -> bool { self.take_profit.is_some() || self.stop_loss.is_some() }
    /// Entry filled, waiting on take-profit / stop-loss.
    pub fn is_open_leg(&self) -> bool { self.status == OrderStatus::Active && self.entry_price.is_some() }
    pub fn notional(&self) -> Decimal { self.limit_price * Decimal::from(self.quantity) }
}

/// Validated placement request, before the store assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub key: PositionKey,
    pub side: Side,
    pub quantity: u64,
    pub limit_price: Decimal,
    pub take_profit: Option<Bracket>,
    pub stop_loss: Option<Bracket>,
}

impl OrderDraft {
    pub fn into_order(self, id: OrderId, now: DateTime<Utc>) -> Order {
        Order {
            id,
            symbol: self.key.symbol,
            exchange: self.key.exchange,
            side: self.side,
            quantity: self.quantity,
            limit_price: self.limit_price,
            take_profit: self.take_profit,
            stop_loss: self.stop_loss,
            status: OrderStatus::Pending,
            entry_price: None,
            executed_price: None,
            exit_price: None,
            exit_reason: None,
            created_at: now,
            closed_at: None,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub exchange: Exchange,
    /// Signed; positive = long.
    pub quantity: i64,
    pub average_cost: Option<Decimal>,
    pub realized_pnl: Decimal,
    /// Shares held back for resting SELL orders and open long legs.
    #[serde(default)]
    pub reserved_qty: i64,
}

impl Position {
    pub fn flat(key: &PositionKey) -> Self {
        Self {
            symbol: key.symbol.clone(),
            exchange: key.exchange,
            quantity: 0,
            average_cost: None,
            realized_pnl: Decimal::ZERO,
            reserved_qty: 0,
        }
    }
    pub fn key(&self) -> PositionKey { PositionKey::new(self.symbol.clone(), self.exchange) }
    pub fn is_dormant(&self) -> bool { self.quantity == 0 }
    /// Flat, nothing reserved and no realized PnL worth keeping.
    pub fn is_removable(&self) -> bool {
        self.is_dormant() && self.reserved_qty == 0 && self.realized_pnl.is_zero()
    }
    /// Long shares not yet promised to another order.
    pub fn free_qty(&self) -> i64 { (self.quantity - self.reserved_qty).max(0) }
    #[cfg(test)]
    pub fn cost_basis(&self) -> Decimal {
        self.average_cost.map(|c| c * Decimal::from(self.quantity)).unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: TradeId,
    pub order_id: OrderId,
    pub symbol: String,
    pub exchange: Exchange,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    /// Signed cash effect: BUY debits, SELL credits.
    pub fn cash_delta(&self) -> Decimal {
        -Decimal::from(self.side.sign()) * Decimal::from(self.quantity) * self.price
    }
}

/// Cash ledger. `reserved` is held back for resting BUY orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cash { pub balance: Decimal, pub reserved: Decimal }

impl Cash {
    pub fn available(&self) -> Decimal { self.balance - self.reserved }
}

/// One price update for a symbol+exchange pair. `high`/`low` cover the interval since the
/// previous tick when the feed knows them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub ts_ns: i128,
    pub key: PositionKey,
    pub price: Decimal,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
}

impl Tick {
    pub fn range_high(&self) -> Decimal { self.high.map_or(self.price, |h| h.max(self.price)) }
    pub fn range_low(&self) -> Decimal { self.low.map_or(self.price, |l| l.min(self.price)) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: String,
    pub exchange: Exchange,
    pub current_price: Decimal,
    pub change: Decimal,
    pub change_percent: Decimal,
    pub day_open: Decimal,
    pub day_high: Decimal,
    pub day_low: Decimal,
    #[serde(rename = "ts")]
    pub ts_ns: i128,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionView {
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: i64,
    pub average_cost: Option<Decimal>,
    pub current_price: Option<Decimal>,
    pub current_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioView {
    pub available_cash: Decimal,
    pub reserved_cash: Decimal,
    pub total_value: Decimal,
    pub total_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: Vec<PositionView>,
}

/// Everything one ledger transaction wrote. Position and cash are present only when they
/// changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub order: Order,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub cash: Option<Cash>,
    #[serde(default)]
    pub trade: Option<Trade>,
}

/// Ledger journal entries, one JSONL line each; replayed in order they rebuild the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// Opening balance of a session.
    Cash(Cash),
    Commit(Commit),
    Note(String),
}
