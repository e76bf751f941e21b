// ===============================
// src/execution.rs (Execution Engine)
// ===============================
//
// Turns a triggered order into a trade. One ledger transaction covers:
//   trade append + position update + cash move + order status,
// and it only goes through while the order is still ACTIVE. Losing that race to a
// cancel/expiry yields `EngineError::Execution` and leaves the ledger untouched.
//
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::domain::{ExitReason, OrderId, OrderStatus, Side, Trade};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{
    BRACKET_EXITS, CASH_AVAILABLE, LOST_RACES, ORDERS_CLOSED, POSITION_QTY, TRADES,
};
use crate::positions::apply_fill;
use crate::store::{LedgerStore, LedgerTxn, TxnTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// The order's own limit fill.
    Entry,
    /// Closing trade of an open bracket leg.
    Exit(ExitReason),
}

pub struct ExecutionEngine {
    store: Arc<dyn LedgerStore>,
}

fn lost(id: OrderId, reason: impl Into<String>) -> EngineError {
    EngineError::Execution { id, reason: reason.into() }
}

impl ExecutionEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self { Self { store } }

    pub fn execute(&self, order_id: OrderId, fill_price: Decimal, leg: Leg) -> EngineResult<Trade> {
        if fill_price <= Decimal::ZERO {
            return Err(lost(order_id, format!("non-positive fill price {fill_price}")));
        }
        let res = self
            .store
            .transact(TxnTarget::Existing(order_id), &mut |txn| commit(txn, fill_price, leg));

        let txn = match res {
            Ok(txn) => txn,
            Err(e @ EngineError::Execution { .. }) => {
                LOST_RACES.inc();
                warn!(order_id, error = %e, "execution aborted");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let trade = txn.trade.clone().ok_or_else(|| lost(order_id, "no trade recorded"))?;
        TRADES.with_label_values(&[trade.side.as_str()]).inc();
        POSITION_QTY
            .with_label_values(&[&trade.symbol, trade.exchange.as_str()])
            .set(txn.position.quantity);
        CASH_AVAILABLE.set(txn.cash.available().to_f64().unwrap_or(0.0));
        if let Leg::Exit(reason) = leg {
            BRACKET_EXITS.with_label_values(&[reason.as_str()]).inc();
        }
        if txn.order.status == OrderStatus::Executed {
            ORDERS_CLOSED.with_label_values(&[OrderStatus::Executed.as_str()]).inc();
        }
        if txn.cash.available() < Decimal::ZERO {
            warn!(order_id, available = %txn.cash.available(), "available cash below zero after exit");
        }
        info!(
            order_id,
            trade_id = trade.id,
            symbol = %trade.symbol,
            exchange = %trade.exchange,
            side = trade.side.as_str(),
            qty = trade.quantity,
            px = %trade.price,
            leg = ?leg,
            status = txn.order.status.as_str(),
            "EXECUTED"
        );
        Ok(trade)
    }
}

/// All four mutations against the staged copy; the store commits them together.
fn commit(txn: &mut LedgerTxn, px: Decimal, leg: Leg) -> EngineResult<()> {
    let id = txn.order.id;
    if txn.order.status != OrderStatus::Active {
        return Err(lost(id, format!("order is {}", txn.order.status.as_str())));
    }
    let qty = txn.order.quantity;

    let trade_side = match leg {
        Leg::Entry => {
            if txn.order.entry_price.is_some() {
                return Err(lost(id, "entry already filled"));
            }
            // the placement reservation is spent by this fill
            match txn.order.side {
                Side::Buy => txn.cash.reserved = (txn.cash.reserved - txn.order.notional()).max(Decimal::ZERO),
                Side::Sell => txn.position.reserved_qty = (txn.position.reserved_qty - qty as i64).max(0),
            }
            txn.order.entry_price = Some(px);
            if txn.order.has_bracket() {
                // shares bought by an open long leg belong to its exit
                if txn.order.side == Side::Buy {
                    txn.position.reserved_qty += qty as i64;
                }
            } else {
                close_executed(txn, px);
            }
            txn.order.side
        }
        Leg::Exit(reason) => {
            let entry = txn.order.entry_price.ok_or_else(|| lost(id, "exit before entry fill"))?;
            if txn.order.side == Side::Buy {
                txn.position.reserved_qty = (txn.position.reserved_qty - qty as i64).max(0);
            }
            close_executed(txn, entry);
            txn.order.exit_price = Some(px);
            txn.order.exit_reason = Some(reason);
            txn.order.side.opposite()
        }
    };

    apply_fill(&mut txn.position, trade_side, qty, px);
    let trade = Trade {
        id: txn.next_trade_id,
        order_id: id,
        symbol: txn.order.symbol.clone(),
        exchange: txn.order.exchange,
        side: trade_side,
        quantity: qty,
        price: px,
        timestamp: txn.now,
    };
    txn.cash.balance += trade.cash_delta();
    txn.trade = Some(trade);
    Ok(())
}

fn close_executed(txn: &mut LedgerTxn, executed_price: Decimal) {
    txn.order.status = OrderStatus::Executed;
    txn.order.executed_price = Some(executed_price);
    txn.order.closed_at = Some(txn.now);
}
