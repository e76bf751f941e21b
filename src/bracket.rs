// ===============================
// src/bracket.rs (Bracket Evaluator)
// ===============================
//
// Per symbol+exchange slot:
//   ACTIVE entry   -> BUY fills once price <= limit, SELL once price >= limit
//   ACTIVE open leg -> exit on take-profit / stop-loss; both crossed in one tick => STOP-LOSS
//
// Ticks for one slot are applied strictly in timestamp order under the slot lock; a tick
// not newer than the last applied one is dropped. Slots evaluate independently, each
// with its own worker task (see `run`).
//
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::domain::{ExitReason, Order, OrderId, OrderStatus, PositionKey, Side, Tick, Trade};
use crate::error::EngineError;
use crate::execution::{ExecutionEngine, Leg};
use crate::metrics::{SLOT_TICKS_DROPPED, STALE_TICKS, TICKS_BY_SYMBOL};
use crate::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
}

/// Long: TP above entry, SL below. Short: inverted. A level outside the `Decimal` range
/// is `None` and never triggers.
pub fn thresholds(order: &Order, entry: Decimal) -> Thresholds {
    let up = |off: Decimal| entry.checked_add(off);
    let down = |off: Decimal| entry.checked_sub(off);
    let long = order.side == Side::Buy;
    Thresholds {
        take_profit: order
            .take_profit
            .and_then(|b| b.offset(entry))
            .and_then(|off| if long { up(off) } else { down(off) }),
        stop_loss: order
            .stop_loss
            .and_then(|b| b.offset(entry))
            .and_then(|off| if long { down(off) } else { up(off) }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    Fill(Decimal),
    Exit(ExitReason, Decimal),
}

/// Pure per-order decision for one tick.
pub fn decide(order: &Order, tick: &Tick) -> Decision {
    if order.status != OrderStatus::Active {
        return Decision::Hold;
    }
    let px = tick.price;
    let entry = match order.entry_price {
        None => {
            let eligible = match order.side {
                Side::Buy => px <= order.limit_price,
                Side::Sell => px >= order.limit_price,
            };
            return if eligible { Decision::Fill(px) } else { Decision::Hold };
        }
        Some(entry) => entry,
    };

    let th = thresholds(order, entry);
    let long = order.side == Side::Buy;
    // (crossed by the interval range, crossed by the current price)
    let above = |level: Decimal| (tick.range_high() >= level, px >= level);
    let below = |level: Decimal| (tick.range_low() <= level, px <= level);

    let sl = th.stop_loss.map(|lvl| (lvl, if long { below(lvl) } else { above(lvl) }));
    let tp = th.take_profit.map(|lvl| (lvl, if long { above(lvl) } else { below(lvl) }));

    if let Some((lvl, (true, at_px))) = sl {
        return Decision::Exit(ExitReason::StopLoss, if at_px { px } else { lvl });
    }
    if let Some((lvl, (true, at_px))) = tp {
        return Decision::Exit(ExitReason::TakeProfit, if at_px { px } else { lvl });
    }
    Decision::Hold
}

#[derive(Debug, Default)]
struct Slot {
    last_ts: Option<i128>,
    orders: BTreeSet<OrderId>,
}

#[derive(Debug, Default, PartialEq)]
pub struct TickOutcome {
    pub stale: bool,
    pub trades: Vec<Trade>,
}

pub struct BracketEvaluator {
    store: Arc<dyn LedgerStore>,
    engine: ExecutionEngine,
    slots: RwLock<HashMap<PositionKey, Arc<Mutex<Slot>>>>,
}

impl BracketEvaluator {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { engine: ExecutionEngine::new(store.clone()), store, slots: RwLock::new(HashMap::new()) }
    }

    fn slot(&self, key: &PositionKey) -> Arc<Mutex<Slot>> {
        if let Some(s) = self.slots.read().unwrap_or_else(|e| e.into_inner()).get(key) {
            return s.clone();
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    pub fn register(&self, order: &Order) {
        let slot = self.slot(&order.key());
        slot.lock().unwrap_or_else(|e| e.into_inner()).orders.insert(order.id);
        debug!(order_id = order.id, key = %order.key(), "registered");
    }

    pub fn deregister(&self, key: &PositionKey, id: OrderId) {
        let slot = self.slot(key);
        slot.lock().unwrap_or_else(|e| e.into_inner()).orders.remove(&id);
    }

    #[cfg(test)]
    pub fn registered(&self, key: &PositionKey) -> Vec<OrderId> {
        let slot = self.slot(key);
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        guard.orders.iter().copied().collect()
    }

    pub fn on_tick(&self, tick: &Tick) -> TickOutcome {
        TICKS_BY_SYMBOL.with_label_values(&[&tick.key.symbol, tick.key.exchange.as_str()]).inc();
        let slot = self.slot(&tick.key);
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());

        if matches!(slot.last_ts, Some(last) if tick.ts_ns <= last) {
            STALE_TICKS.inc();
            debug!(key = %tick.key, ts = tick.ts_ns, "stale tick dropped");
            return TickOutcome { stale: true, trades: Vec::new() };
        }
        slot.last_ts = Some(tick.ts_ns);

        let mut trades = Vec::new();
        let ids: Vec<OrderId> = slot.orders.iter().copied().collect();
        for id in ids {
            // the store is authoritative; a stale registration is simply dropped
            let order = match self.store.get_order(id) {
                Some(o) if !o.status.is_terminal() => o,
                _ => {
                    slot.orders.remove(&id);
                    continue;
                }
            };
            let leg = match decide(&order, tick) {
                Decision::Hold => continue,
                Decision::Fill(px) => (Leg::Entry, px),
                Decision::Exit(reason, px) => (Leg::Exit(reason), px),
            };
            match self.engine.execute(id, leg.1, leg.0) {
                Ok(trade) => trades.push(trade),
                Err(EngineError::Execution { .. }) => {}
                Err(e) => error!(order_id = id, error = %e, "execution failed"),
            }
            if self.store.get_order(id).map_or(true, |o| o.status.is_terminal()) {
                slot.orders.remove(&id);
            }
        }
        TickOutcome { stale: false, trades }
    }
}

async fn slot_worker(evaluator: Arc<BracketEvaluator>, mut rx: mpsc::Receiver<Tick>) {
    while let Some(tick) = rx.recv().await {
        let ev = evaluator.clone();
        // evaluation takes std locks; keep it off the async workers
        match tokio::task::spawn_blocking(move || ev.on_tick(&tick)).await {
            Ok(out) if out.stale || out.trades.is_empty() => {}
            Ok(out) => debug!(trades = out.trades.len(), "tick applied"),
            Err(e) => error!(?e, "tick evaluation panicked"),
        }
    }
}

/// Dispatcher: fan the tick bus out to one worker per symbol+exchange.
pub async fn run(evaluator: Arc<BracketEvaluator>, mut md_rx: broadcast::Receiver<Tick>) {
    let mut workers: HashMap<PositionKey, mpsc::Sender<Tick>> = HashMap::new();
    loop {
        match md_rx.recv().await {
            Ok(tick) => {
                let tx = workers.entry(tick.key.clone()).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel::<Tick>(256);
                    tokio::spawn(slot_worker(evaluator.clone(), rx));
                    tx
                });
                // a full queue only holds up its own slot
                match tx.try_send(tick) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(t)) => {
                        SLOT_TICKS_DROPPED.with_label_values(&[&t.key.symbol, t.key.exchange.as_str()]).inc();
                        warn!(key = %t.key, ts = t.ts_ns, "slot queue full, tick dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(t)) => {
                        error!(key = %t.key, "slot worker gone");
                        workers.remove(&t.key);
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "evaluator lagging, ticks skipped"),
            Err(broadcast::error::RecvError::Closed) => {
                warn!("tick bus closed, evaluator stopped");
                break;
            }
        }
    }
}
