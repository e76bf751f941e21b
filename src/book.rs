// ===============================
// src/book.rs (Order Book)
// ===============================
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::bracket::BracketEvaluator;
use crate::config::Limits;
use crate::domain::{Order, OrderId, OrderStatus, Side};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{ORDERS_CLOSED, ORDERS_PLACED, ORDERS_REJECTED};
use crate::risk::{self, OrderRequest};
use crate::store::{LedgerStore, LedgerTxn, OrderFilter, TxnTarget};

/// Owns every order status write except the execution transition.
pub struct OrderBook {
    store: Arc<dyn LedgerStore>,
    evaluator: Arc<BracketEvaluator>,
    limits: Limits,
}

/// Capital check + hold for a new order.
fn reserve(txn: &mut LedgerTxn) -> EngineResult<()> {
    let qty = txn.order.quantity;
    match txn.order.side {
        Side::Buy => {
            let needed = txn.order.notional();
            let available = txn.cash.available();
            if available < needed {
                return Err(EngineError::InsufficientFunds {
                    needed: needed.to_string(),
                    available: available.to_string(),
                });
            }
            txn.cash.reserved += needed;
        }
        Side::Sell => {
            let free = txn.position.free_qty();
            if free < qty as i64 {
                return Err(EngineError::InsufficientPosition { needed: qty, free });
            }
            txn.position.reserved_qty += qty as i64;
        }
    }
    Ok(())
}

/// Undo whatever the order still holds: the placement hold before the entry fill, the
/// exit shares of an open long leg after it.
fn release(txn: &mut LedgerTxn) {
    let qty = txn.order.quantity as i64;
    match (txn.order.entry_price.is_some(), txn.order.side) {
        (false, Side::Buy) => {
            txn.cash.reserved = (txn.cash.reserved - txn.order.notional()).max(Decimal::ZERO);
        }
        (false, Side::Sell) | (true, Side::Buy) => {
            txn.position.reserved_qty = (txn.position.reserved_qty - qty).max(0);
        }
        (true, Side::Sell) => {}
    }
}

/// Terminal transition away from PENDING/ACTIVE.
fn close(txn: &mut LedgerTxn, status: OrderStatus) -> EngineResult<()> {
    if txn.order.status.is_terminal() {
        return Err(EngineError::InvalidState { id: txn.order.id, status: txn.order.status });
    }
    release(txn);
    txn.order.status = status;
    txn.order.closed_at = Some(txn.now);
    Ok(())
}

impl OrderBook {
    pub fn new(store: Arc<dyn LedgerStore>, evaluator: Arc<BracketEvaluator>, limits: Limits) -> Self {
        Self { store, evaluator, limits }
    }

    pub fn place(&self, req: &OrderRequest) -> EngineResult<Order> {
        let draft = risk::validate(req, &self.limits)?;

        let placed = match self.store.transact(TxnTarget::Insert(draft), &mut |txn| reserve(txn)) {
            Ok(txn) => txn.order,
            Err(e) => {
                warn!(symbol = %req.symbol, error = %e, "order rejected");
                ORDERS_REJECTED.with_label_values(&[e.kind()]).inc();
                return Err(e);
            }
        };

        self.evaluator.register(&placed);
        let activated = self.store.transact(TxnTarget::Existing(placed.id), &mut |txn| {
            if txn.order.status != OrderStatus::Pending {
                return Err(EngineError::InvalidState { id: txn.order.id, status: txn.order.status });
            }
            txn.order.status = OrderStatus::Active;
            Ok(())
        });
        let order = match activated {
            Ok(txn) => txn.order,
            // cancelled between insert and activation; that outcome stands
            Err(EngineError::InvalidState { .. }) => {
                self.evaluator.deregister(&placed.key(), placed.id);
                self.get(placed.id)?
            }
            Err(e) => return Err(e),
        };

        ORDERS_PLACED.inc();
        info!(
            order_id = order.id,
            symbol = %order.symbol,
            exchange = %order.exchange,
            side = order.side.as_str(),
            qty = order.quantity,
            limit = %order.limit_price,
            tp = ?order.take_profit,
            sl = ?order.stop_loss,
            "order placed"
        );
        Ok(order)
    }

    pub fn cancel(&self, id: OrderId) -> EngineResult<Order> {
        let order = self.finish(id, OrderStatus::Cancelled)?;
        info!(order_id = id, open_leg = order.entry_price.is_some(), "order cancelled");
        Ok(order)
    }

    fn finish(&self, id: OrderId, status: OrderStatus) -> EngineResult<Order> {
        let txn = self.store.transact(TxnTarget::Existing(id), &mut |txn| close(txn, status))?;
        self.evaluator.deregister(&txn.order.key(), id);
        ORDERS_CLOSED.with_label_values(&[status.as_str()]).inc();
        Ok(txn.order)
    }

    /// Expires unfilled entries older than `ttl`. Open legs are left alone.
    pub fn expire_due(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<Order> {
        let mut expired = Vec::new();
        for o in self.store.list_orders(&OrderFilter::open()) {
            if o.entry_price.is_some() || o.created_at + ttl > now {
                continue;
            }
            let res = self.store.transact(TxnTarget::Existing(o.id), &mut |txn| {
                // a fill may have landed since the listing
                if txn.order.entry_price.is_some() {
                    return Err(EngineError::InvalidState { id: txn.order.id, status: txn.order.status });
                }
                close(txn, OrderStatus::Expired)
            });
            match res {
                Ok(txn) => {
                    self.evaluator.deregister(&txn.order.key(), o.id);
                    ORDERS_CLOSED.with_label_values(&[OrderStatus::Expired.as_str()]).inc();
                    info!(order_id = o.id, "order expired");
                    expired.push(txn.order);
                }
                Err(EngineError::InvalidState { .. }) => {}
                Err(e) => warn!(order_id = o.id, error = %e, "expiry failed"),
            }
        }
        expired
    }

    /// Re-registers resting orders, e.g. after a journal replay.
    pub fn resume(&self) -> usize {
        let open = self.store.list_orders(&OrderFilter::open());
        for o in &open {
            self.evaluator.register(o);
        }
        // a crash between insert and activation leaves PENDING behind
        for o in open.iter().filter(|o| o.status == OrderStatus::Pending) {
            let res = self.store.transact(TxnTarget::Existing(o.id), &mut |txn| {
                if txn.order.status == OrderStatus::Pending {
                    txn.order.status = OrderStatus::Active;
                }
                Ok(())
            });
            match res {
                Ok(_) => info!(order_id = o.id, "pending order activated on resume"),
                Err(e) => warn!(order_id = o.id, error = %e, "pending order left inactive on resume"),
            }
        }
        open.len()
    }

    pub fn get(&self, id: OrderId) -> EngineResult<Order> {
        self.store.get_order(id).ok_or(EngineError::NotFound(id))
    }

    pub fn list(&self, filter: &OrderFilter) -> Vec<Order> {
        self.store.list_orders(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Exchange, PositionKey, Tick};
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;
    use std::sync::Barrier;

    fn desk(cash: Decimal) -> (Arc<MemoryStore>, Arc<BracketEvaluator>, Arc<OrderBook>) {
        let store = Arc::new(MemoryStore::new(cash));
        let evaluator = Arc::new(BracketEvaluator::new(store.clone()));
        let book = Arc::new(OrderBook::new(store.clone(), evaluator.clone(), Limits::default()));
        (store, evaluator, book)
    }

    fn req(side: &str, qty: i64, limit: i64) -> OrderRequest {
        serde_json::from_value(serde_json::json!({
            "symbol": "SYM", "exchange": "NSE", "side": side, "quantity": qty, "limitPrice": limit,
            "takeProfit": {"type": "PERCENTAGE", "value": 5}
        }))
        .unwrap()
    }

    fn key() -> PositionKey { PositionKey::new("SYM", Exchange::Nse) }

    fn tick(ts: i128, px: Decimal) -> Tick { Tick { ts_ns: ts, key: key(), price: px, high: None, low: None } }

    #[test]
    fn placement_reserves_cash_and_registers() {
        let (store, ev, book) = desk(dec!(5_000));
        let o = book.place(&req("BUY", 10, 100)).unwrap();
        assert_eq!(o.status, OrderStatus::Active);
        assert_eq!(o.id, 1);
        assert_eq!(store.snapshot().cash.available(), dec!(4_000));
        assert_eq!(ev.registered(&key()), vec![o.id]);
    }

    #[test]
    fn insufficient_funds_creates_nothing() {
        let (store, _ev, book) = desk(dec!(500));
        let err = book.place(&req("BUY", 10, 100)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert!(book.list(&OrderFilter::all()).is_empty());
        assert_eq!(store.snapshot().cash.balance, dec!(500));
        assert_eq!(store.snapshot().cash.reserved, Decimal::ZERO);
    }

    #[test]
    fn reservations_stack_across_orders() {
        let (_store, _ev, book) = desk(dec!(1_500));
        book.place(&req("BUY", 10, 100)).unwrap();
        let err = book.place(&req("BUY", 6, 100)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    }

    #[test]
    fn sell_needs_free_shares() {
        let (_store, ev, book) = desk(dec!(5_000));
        assert!(matches!(
            book.place(&req("SELL", 1, 100)).unwrap_err(),
            EngineError::InsufficientPosition { needed: 1, free: 0 }
        ));

        let buy: OrderRequest = serde_json::from_value(serde_json::json!({
            "symbol": "SYM", "exchange": "NSE", "side": "BUY", "quantity": 10, "limitPrice": 100
        }))
        .unwrap();
        book.place(&buy).unwrap();
        ev.on_tick(&tick(1, dec!(100)));

        book.place(&req("SELL", 6, 120)).unwrap();
        assert!(matches!(
            book.place(&req("SELL", 5, 120)).unwrap_err(),
            EngineError::InsufficientPosition { needed: 5, free: 4 }
        ));
    }

    #[test]
    fn cancel_releases_and_is_final() {
        let (store, ev, book) = desk(dec!(5_000));
        let o = book.place(&req("BUY", 10, 100)).unwrap();
        let c = book.cancel(o.id).unwrap();
        assert_eq!(c.status, OrderStatus::Cancelled);
        assert!(c.closed_at.is_some());
        assert_eq!(store.snapshot().cash.reserved, Decimal::ZERO);
        assert!(ev.registered(&key()).is_empty());

        assert!(matches!(book.cancel(o.id), Err(EngineError::InvalidState { .. })));
        assert!(matches!(book.cancel(999), Err(EngineError::NotFound(999))));
        // a tick that would have filled it does nothing now
        assert!(ev.on_tick(&tick(1, dec!(90))).trades.is_empty());
    }

    #[test]
    fn executed_orders_cannot_be_cancelled() {
        let (_store, ev, book) = desk(dec!(5_000));
        let plain: OrderRequest = serde_json::from_value(serde_json::json!({
            "symbol": "SYM", "exchange": "NSE", "side": "BUY", "quantity": 1, "limitPrice": 100
        }))
        .unwrap();
        let o = book.place(&plain).unwrap();
        ev.on_tick(&tick(1, dec!(100)));
        assert!(matches!(
            book.cancel(o.id),
            Err(EngineError::InvalidState { status: OrderStatus::Executed, .. })
        ));
    }

    #[test]
    fn cancelling_an_open_leg_keeps_the_position() {
        let (store, ev, book) = desk(dec!(5_000));
        let o = book.place(&req("BUY", 10, 100)).unwrap();
        ev.on_tick(&tick(1, dec!(100)));
        assert_eq!(store.get_position(&key()).unwrap().reserved_qty, 10);

        book.cancel(o.id).unwrap();
        let pos = store.get_position(&key()).unwrap();
        assert_eq!(pos.quantity, 10);
        assert_eq!(pos.reserved_qty, 0);
        assert!(ev.on_tick(&tick(2, dec!(200))).trades.is_empty());
    }

    #[test]
    fn concurrent_cancels_have_one_winner() {
        for _ in 0..50 {
            let (_store, _ev, book) = desk(dec!(5_000));
            let id = book.place(&req("BUY", 10, 100)).unwrap().id;
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let (book, barrier) = (book.clone(), barrier.clone());
                    std::thread::spawn(move || {
                        barrier.wait();
                        book.cancel(id)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let ok = results.iter().filter(|r| matches!(r, Ok(o) if o.status == OrderStatus::Cancelled)).count();
            let lost = results.iter().filter(|r| matches!(r, Err(EngineError::InvalidState { .. }))).count();
            assert_eq!((ok, lost), (1, 1));
        }
    }

    #[test]
    fn cancel_racing_a_fill_resolves_to_one_terminal_state() {
        for i in 0..50 {
            let (store, ev, book) = desk(dec!(5_000));
            let plain: OrderRequest = serde_json::from_value(serde_json::json!({
                "symbol": "SYM", "exchange": "NSE", "side": "BUY", "quantity": 10, "limitPrice": 100
            }))
            .unwrap();
            let id = book.place(&plain).unwrap().id;
            let barrier = Arc::new(Barrier::new(2));
            let t = {
                let (ev, barrier) = (ev.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    ev.on_tick(&tick(i + 1, dec!(100)))
                })
            };
            barrier.wait();
            let cancelled = book.cancel(id);
            let filled = t.join().unwrap().trades.len();

            let o = store.get_order(id).unwrap();
            let snap = store.snapshot();
            assert_eq!(snap.cash.reserved, Decimal::ZERO);
            match o.status {
                OrderStatus::Executed => {
                    assert!(cancelled.is_err());
                    assert_eq!(filled, 1);
                    assert_eq!(snap.cash.balance, dec!(4_000));
                }
                OrderStatus::Cancelled => {
                    assert!(cancelled.is_ok());
                    assert_eq!(filled, 0);
                    assert_eq!(snap.cash.balance, dec!(5_000));
                }
                other => panic!("unexpected status {other:?}"),
            }
        }
    }

    #[test]
    fn stale_entries_expire_but_open_legs_do_not() {
        let (store, ev, book) = desk(dec!(5_000));
        let resting = book.place(&req("BUY", 10, 90)).unwrap();
        let open = book.place(&req("BUY", 10, 100)).unwrap();
        ev.on_tick(&tick(1, dec!(95)));
        assert!(store.get_order(open.id).unwrap().is_open_leg());

        assert!(book.expire_due(Utc::now(), Duration::hours(1)).is_empty());
        let expired = book.expire_due(Utc::now() + Duration::hours(2), Duration::hours(1));
        assert_eq!(expired.iter().map(|o| o.id).collect::<Vec<_>>(), vec![resting.id]);
        assert_eq!(expired[0].status, OrderStatus::Expired);
        assert_eq!(store.get_order(open.id).unwrap().status, OrderStatus::Active);
        assert_eq!(store.snapshot().cash.reserved, Decimal::ZERO);
    }

    #[test]
    fn resume_registers_replayed_orders() {
        let (store, _ev, book) = desk(dec!(5_000));
        let o = book.place(&req("BUY", 10, 100)).unwrap();
        let evaluator = Arc::new(BracketEvaluator::new(store.clone()));
        let fresh = OrderBook::new(store.clone(), evaluator.clone(), Limits::default());
        assert_eq!(fresh.resume(), 1);
        assert_eq!(evaluator.registered(&key()), vec![o.id]);
    }

    #[test]
    fn replayed_pending_order_is_activated_and_fills() {
        // journal cut between the reserving insert and the activation
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let store = MemoryStore::new(dec!(5_000)).with_journal(tx);
        let draft = risk::validate(&req("BUY", 10, 100), &Limits::default()).unwrap();
        let pending = store.transact(TxnTarget::Insert(draft), &mut |txn| reserve(txn)).unwrap().order;
        assert_eq!(pending.status, OrderStatus::Pending);
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }

        let store = Arc::new(MemoryStore::restore(dec!(5_000), events));
        assert_eq!(store.get_order(pending.id).unwrap().status, OrderStatus::Pending);
        let evaluator = Arc::new(BracketEvaluator::new(store.clone()));
        let book = OrderBook::new(store.clone(), evaluator.clone(), Limits::default());
        assert_eq!(book.resume(), 1);
        assert_eq!(book.get(pending.id).unwrap().status, OrderStatus::Active);
        assert_eq!(store.snapshot().cash.available(), dec!(4_000));

        let out = evaluator.on_tick(&tick(1, dec!(100)));
        assert_eq!(out.trades.len(), 1);
        let o = book.get(pending.id).unwrap();
        assert_eq!(o.entry_price, Some(dec!(100)));
        assert!(o.is_open_leg());
        assert_eq!(store.snapshot().cash.reserved, dec!(0));
    }
}
