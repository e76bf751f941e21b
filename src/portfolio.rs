// ===============================
// src/portfolio.rs (Portfolio Projector)
// ===============================
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::{PortfolioView, PositionKey, PositionView};
use crate::metrics::{CASH_AVAILABLE, PNL_REALIZED, PNL_UNREALIZED};
use crate::positions::unrealized;
use crate::store::AccountSnapshot;

/// Read-only view over one account snapshot. Positions without a price are valued at
/// average cost, i.e. zero unrealized.
pub fn project(snap: &AccountSnapshot, price: impl Fn(&PositionKey) -> Option<Decimal>) -> PortfolioView {
    let mut positions = Vec::new();
    let mut market_value = Decimal::ZERO;
    let mut realized = Decimal::ZERO;
    let mut unrealized_total = Decimal::ZERO;

    for p in &snap.positions {
        realized += p.realized_pnl;
        if p.quantity == 0 {
            continue;
        }
        let current_price = price(&p.key());
        let mark = current_price.or(p.average_cost).unwrap_or(Decimal::ZERO);
        let current_value = mark * Decimal::from(p.quantity);
        let upnl = unrealized(p, mark);
        market_value += current_value;
        unrealized_total += upnl;
        positions.push(PositionView {
            symbol: p.symbol.clone(),
            exchange: p.exchange,
            quantity: p.quantity,
            average_cost: p.average_cost,
            current_price,
            current_value,
            unrealized_pnl: upnl,
            realized_pnl: p.realized_pnl,
        });
    }

    PortfolioView {
        available_cash: snap.cash.available(),
        reserved_cash: snap.cash.reserved,
        total_value: snap.cash.balance + market_value,
        total_pnl: realized + unrealized_total,
        realized_pnl: realized,
        unrealized_pnl: unrealized_total,
        positions,
    }
}

pub fn publish_gauges(view: &PortfolioView) {
    CASH_AVAILABLE.set(view.available_cash.to_f64().unwrap_or(0.0));
    PNL_REALIZED.set(view.realized_pnl.to_f64().unwrap_or(0.0));
    PNL_UNREALIZED.set(view.unrealized_pnl.to_f64().unwrap_or(0.0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Cash, Exchange, Position};
    use rust_decimal_macros::dec;

    fn pos(sym: &str, qty: i64, avg: Option<Decimal>, realized: Decimal) -> Position {
        Position {
            symbol: sym.into(),
            exchange: Exchange::Nse,
            quantity: qty,
            average_cost: avg,
            realized_pnl: realized,
            reserved_qty: 0,
        }
    }

    #[test]
    fn values_long_and_short_at_market() {
        let snap = AccountSnapshot {
            cash: Cash { balance: dec!(10_000), reserved: dec!(1_000) },
            positions: vec![
                pos("AAA", 10, Some(dec!(100)), dec!(5)),
                pos("BBB", -4, Some(dec!(50)), Decimal::ZERO),
            ],
        };
        let view = project(&snap, |k| match k.symbol.as_str() {
            "AAA" => Some(dec!(110)),
            "BBB" => Some(dec!(45)),
            _ => None,
        });
        assert_eq!(view.available_cash, dec!(9_000));
        assert_eq!(view.reserved_cash, dec!(1_000));
        // 10_000 + 1_100 - 180
        assert_eq!(view.total_value, dec!(10_920));
        assert_eq!(view.unrealized_pnl, dec!(120));
        assert_eq!(view.total_pnl, dec!(125));
        assert_eq!(view.positions[1].current_value, dec!(-180));
    }

    #[test]
    fn missing_price_marks_at_cost() {
        let snap = AccountSnapshot {
            cash: Cash { balance: dec!(0), reserved: dec!(0) },
            positions: vec![pos("AAA", 3, Some(dec!(20)), Decimal::ZERO)],
        };
        let view = project(&snap, |_| None);
        assert_eq!(view.positions[0].current_price, None);
        assert_eq!(view.positions[0].current_value, dec!(60));
        assert_eq!(view.unrealized_pnl, Decimal::ZERO);
    }

    #[test]
    fn flat_positions_only_count_realized() {
        let snap = AccountSnapshot {
            cash: Cash { balance: dec!(100), reserved: dec!(0) },
            positions: vec![pos("AAA", 0, None, dec!(-7))],
        };
        let view = project(&snap, |_| Some(dec!(1)));
        assert!(view.positions.is_empty());
        assert_eq!(view.realized_pnl, dec!(-7));
        assert_eq!(view.total_pnl, dec!(-7));
        assert_eq!(view.total_value, dec!(100));
    }
}
