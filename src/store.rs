// ===============================
// src/store.rs (Ledger Store)
// ===============================
//
// Orders, positions, trades and cash behind one transaction primitive:
// - `transact` stages the order (new or existing), its position and the cash balance,
//   runs the caller's mutation on the staged copy and commits all of it or nothing.
// - Lock order is always account -> orders, so a commit sees a consistent pair.
// - Every commit is mirrored to the journal channel (if any) as ONE `Event::Commit` while
//   the locks are held, which keeps the JSONL file in commit order and makes each line a
//   whole transaction: a torn tail loses the last commit, never half of it.
//
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{
    Cash, Commit, Event, Order, OrderDraft, OrderId, OrderStatus, Position, PositionKey, Trade, TradeId,
};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub statuses: Option<Vec<OrderStatus>>,
    pub key: Option<PositionKey>,
}

impl OrderFilter {
    pub fn all() -> Self { Self::default() }

    /// Resting orders: PENDING or ACTIVE.
    pub fn open() -> Self {
        Self { statuses: Some(vec![OrderStatus::Pending, OrderStatus::Active]), key: None }
    }

    pub fn with_key(mut self, key: PositionKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn matches(&self, o: &Order) -> bool {
        let status_ok = self.statuses.as_ref().map_or(true, |s| s.contains(&o.status));
        let key_ok = self
            .key
            .as_ref()
            .map_or(true, |k| k.symbol == o.symbol && k.exchange == o.exchange);
        status_ok && key_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountSnapshot {
    pub cash: Cash,
    pub positions: Vec<Position>,
}

/// Staged state handed to a transaction. Whatever is left here on `Ok` is committed.
#[derive(Debug, Clone)]
pub struct LedgerTxn {
    pub order: Order,
    pub position: Position,
    pub cash: Cash,
    /// Appended to the trade tape on commit.
    pub trade: Option<Trade>,
    /// Id the trade must carry if one is appended.
    pub next_trade_id: TradeId,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum TxnTarget {
    Insert(OrderDraft),
    Existing(OrderId),
}

pub trait LedgerStore: Send + Sync {
    fn get_order(&self, id: OrderId) -> Option<Order>;
    /// Most-recent-first.
    fn list_orders(&self, filter: &OrderFilter) -> Vec<Order>;
    /// Most-recent-first.
    fn list_trades(&self) -> Vec<Trade>;
    fn get_position(&self, key: &PositionKey) -> Option<Position>;
    fn snapshot(&self) -> AccountSnapshot;
    fn transact(
        &self,
        target: TxnTarget,
        f: &mut dyn FnMut(&mut LedgerTxn) -> EngineResult<()>,
    ) -> EngineResult<LedgerTxn>;
}

#[derive(Debug, Default)]
struct Account {
    cash: Cash,
    positions: HashMap<PositionKey, Position>,
    trades: Vec<Trade>,
    next_trade_id: TradeId,
}

impl Account {
    fn put_position(&mut self, pos: Position) {
        if pos.is_removable() {
            self.positions.remove(&pos.key());
        } else {
            self.positions.insert(pos.key(), pos);
        }
    }

    fn push_trade(&mut self, trade: Trade) {
        self.next_trade_id = self.next_trade_id.max(trade.id + 1);
        self.trades.push(trade);
    }

    fn apply(&mut self, c: Commit, orders: &mut Orders) {
        orders.upsert(c.order);
        if let Some(p) = c.position {
            self.put_position(p);
        }
        if let Some(cash) = c.cash {
            self.cash = cash;
        }
        if let Some(t) = c.trade {
            self.push_trade(t);
        }
    }
}

#[derive(Debug, Default)]
struct Orders {
    by_id: BTreeMap<OrderId, Order>,
    by_status: HashMap<OrderStatus, BTreeSet<OrderId>>,
    by_key: HashMap<PositionKey, BTreeSet<OrderId>>,
    next_id: OrderId,
}

impl Orders {
    fn upsert(&mut self, order: Order) {
        if let Some(prev) = self.by_id.get(&order.id) {
            if let Some(ids) = self.by_status.get_mut(&prev.status) {
                ids.remove(&prev.id);
            }
        }
        self.by_status.entry(order.status).or_default().insert(order.id);
        self.by_key.entry(order.key()).or_default().insert(order.id);
        self.next_id = self.next_id.max(order.id + 1);
        self.by_id.insert(order.id, order);
    }

    fn candidates(&self, filter: &OrderFilter) -> Vec<OrderId> {
        // narrowest secondary index first
        let mut ids: Vec<OrderId> = match (&filter.key, &filter.statuses) {
            (Some(k), _) => self.by_key.get(k).map(|s| s.iter().copied().collect()).unwrap_or_default(),
            (None, Some(statuses)) => statuses
                .iter()
                .filter_map(|s| self.by_status.get(s))
                .flat_map(|s| s.iter().copied())
                .collect(),
            (None, None) => self.by_id.keys().copied().collect(),
        };
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }
}

pub struct MemoryStore {
    account: Mutex<Account>,
    orders: RwLock<Orders>,
    journal: Option<mpsc::UnboundedSender<Event>>,
}

impl MemoryStore {
    pub fn new(starting_cash: Decimal) -> Self {
        Self::restore(starting_cash, std::iter::empty())
    }

    /// Rebuilds state from a journal. A `Cash` entry overrides `starting_cash`.
    pub fn restore(starting_cash: Decimal, events: impl IntoIterator<Item = Event>) -> Self {
        let mut account = Account {
            cash: Cash { balance: starting_cash, reserved: Decimal::ZERO },
            next_trade_id: 1,
            ..Default::default()
        };
        let mut orders = Orders { next_id: 1, ..Default::default() };
        let mut replayed = 0usize;
        for ev in events {
            match ev {
                Event::Commit(c) => account.apply(c, &mut orders),
                Event::Cash(c) => account.cash = c,
                Event::Note(_) => {}
            }
            replayed += 1;
        }
        if replayed > 0 {
            debug!(replayed, orders = orders.by_id.len(), trades = account.trades.len(), "ledger restored");
        }
        Self { account: Mutex::new(account), orders: RwLock::new(orders), journal: None }
    }

    /// Mirror every commit to `tx`. The current cash line is written first so a fresh
    /// journal replays to the right opening balance.
    pub fn with_journal(mut self, tx: mpsc::UnboundedSender<Event>) -> Self {
        let cash = self.lock_account().map(|a| a.cash).unwrap_or_default();
        let _ = tx.send(Event::Cash(cash));
        self.journal = Some(tx);
        self
    }

    fn emit(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            if tx.send(ev).is_err() {
                warn!("ledger journal closed, commit not recorded");
            }
        }
    }

    fn lock_account(&self) -> EngineResult<MutexGuard<'_, Account>> {
        self.account.lock().map_err(|_| EngineError::Store("account lock poisoned".into()))
    }

    fn write_orders(&self) -> EngineResult<RwLockWriteGuard<'_, Orders>> {
        self.orders.write().map_err(|_| EngineError::Store("order lock poisoned".into()))
    }

    fn read_orders(&self) -> RwLockReadGuard<'_, Orders> {
        self.orders.read().unwrap_or_else(|e| e.into_inner())
    }

    fn read_account(&self) -> MutexGuard<'_, Account> {
        self.account.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LedgerStore for MemoryStore {
    fn get_order(&self, id: OrderId) -> Option<Order> {
        self.read_orders().by_id.get(&id).cloned()
    }

    fn list_orders(&self, filter: &OrderFilter) -> Vec<Order> {
        let orders = self.read_orders();
        orders
            .candidates(filter)
            .into_iter()
            .filter_map(|id| orders.by_id.get(&id))
            .filter(|o| filter.matches(o))
            .cloned()
            .collect()
    }

    fn list_trades(&self) -> Vec<Trade> {
        self.read_account().trades.iter().rev().cloned().collect()
    }

    fn get_position(&self, key: &PositionKey) -> Option<Position> {
        self.read_account().positions.get(key).cloned()
    }

    fn snapshot(&self) -> AccountSnapshot {
        let account = self.read_account();
        let mut positions: Vec<Position> = account.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.key().cmp(&b.key()));
        AccountSnapshot { cash: account.cash, positions }
    }

    fn transact(
        &self,
        target: TxnTarget,
        f: &mut dyn FnMut(&mut LedgerTxn) -> EngineResult<()>,
    ) -> EngineResult<LedgerTxn> {
        let mut account = self.lock_account()?;
        let mut orders = self.write_orders()?;
        let now = Utc::now();

        let order = match target {
            TxnTarget::Insert(draft) => draft.into_order(orders.next_id, now),
            TxnTarget::Existing(id) => orders.by_id.get(&id).cloned().ok_or(EngineError::NotFound(id))?,
        };
        let key = order.key();
        let position = account.positions.get(&key).cloned().unwrap_or_else(|| Position::flat(&key));
        let mut txn = LedgerTxn {
            order,
            position,
            cash: account.cash,
            trade: None,
            next_trade_id: account.next_trade_id,
            now,
        };
        let before_position = txn.position.clone();
        let before_cash = txn.cash;

        f(&mut txn)?;

        txn.order.version += 1;
        let commit = Commit {
            order: txn.order.clone(),
            position: (txn.position != before_position).then(|| txn.position.clone()),
            cash: (txn.cash != before_cash).then_some(txn.cash),
            trade: txn.trade.clone(),
        };
        if self.journal.is_some() {
            self.emit(Event::Commit(commit.clone()));
        }
        account.apply(commit, &mut orders);
        Ok(txn)
    }
}
