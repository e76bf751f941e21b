// ===============================
// src/posttrade.rs
// ===============================
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::{Event, OrderStatus};
use crate::metrics::{CASH_AVAILABLE, POSITION_QTY};

/// Logs the tape and keeps the ledger gauges in step with every commit.
pub fn handle(ev: &Event) {
    match ev {
        Event::Commit(c) => {
            if let Some(t) = &c.trade {
                info!(
                    trade_id = t.id,
                    order_id = t.order_id,
                    symbol = %t.symbol,
                    exchange = %t.exchange,
                    side = t.side.as_str(),
                    qty = t.quantity,
                    px = %t.price,
                    "TRADE"
                );
            }
            let o = &c.order;
            if o.status.is_terminal() {
                info!(
                    order_id = o.id,
                    symbol = %o.symbol,
                    status = o.status.as_str(),
                    executed_px = ?o.executed_price,
                    exit_px = ?o.exit_price,
                    exit_reason = ?o.exit_reason.map(|r| r.as_str()),
                    "CLOSED"
                );
            } else if o.status == OrderStatus::Active && o.entry_price.is_some() {
                debug!(order_id = o.id, entry_px = ?o.entry_price, "bracket armed");
            }
            if let Some(p) = &c.position {
                POSITION_QTY.with_label_values(&[&p.symbol, p.exchange.as_str()]).set(p.quantity);
            }
            if let Some(cash) = &c.cash {
                CASH_AVAILABLE.set(cash.available().to_f64().unwrap_or(0.0));
            }
        }
        Event::Cash(c) => CASH_AVAILABLE.set(c.available().to_f64().unwrap_or(0.0)),
        Event::Note(n) => info!(note = %n, "ledger note"),
    }
}

pub async fn run(mut rx: mpsc::Receiver<Event>) {
    while let Some(ev) = rx.recv().await {
        handle(&ev);
    }
}
