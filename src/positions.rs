// ===============================
// src/positions.rs (average cost & realized PnL)
// ===============================
use rust_decimal::Decimal;

use crate::domain::{Position, Side};

/// Applies one fill to a position and returns the PnL it realized.
///
/// Same direction (or flat) -> weighted average cost.
/// Opposite direction -> realize on the closed portion; if the fill is larger than the
/// open quantity the remainder opens the other side at `px` as a fresh average cost.
pub fn apply_fill(pos: &mut Position, side: Side, qty: u64, px: Decimal) -> Decimal {
    let signed_qty = side.sign() * qty as i64;
    let prev_qty = pos.quantity;
    let new_qty = prev_qty + signed_qty;

    if prev_qty == 0 || prev_qty.signum() == signed_qty.signum() {
        let avg = match pos.average_cost {
            Some(avg) if prev_qty != 0 => {
                let prev_abs = Decimal::from(prev_qty.abs());
                let add_abs = Decimal::from(qty);
                (avg * prev_abs + px * add_abs) / (prev_abs + add_abs)
            }
            _ => px,
        };
        pos.average_cost = Some(avg);
        pos.quantity = new_qty;
        return Decimal::ZERO;
    }

    let qty_closed = signed_qty.abs().min(prev_qty.abs());
    let avg = pos.average_cost.unwrap_or(px);
    // long closes earn (px - avg), short closes earn (avg - px)
    let per_unit = if prev_qty > 0 { px - avg } else { avg - px };
    let pnl = per_unit * Decimal::from(qty_closed);
    pos.realized_pnl += pnl;
    pos.quantity = new_qty;

    if new_qty == 0 {
        pos.average_cost = None;
    } else if new_qty.signum() != prev_qty.signum() {
        pos.average_cost = Some(px);
    }
    pnl
}

/// Mark-to-market PnL of the open quantity.
pub fn unrealized(pos: &Position, mark: Decimal) -> Decimal {
    match pos.average_cost {
        Some(avg) if pos.quantity != 0 => (mark - avg) * Decimal::from(pos.quantity),
        _ => Decimal::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Exchange, PositionKey};
    use rust_decimal_macros::dec;

    fn flat() -> Position { Position::flat(&PositionKey::new("SYM", Exchange::Nse)) }

    #[test]
    fn buys_average_their_cost() {
        let mut p = flat();
        apply_fill(&mut p, Side::Buy, 10, dec!(100));
        apply_fill(&mut p, Side::Buy, 30, dec!(120));
        assert_eq!(p.quantity, 40);
        assert_eq!(p.average_cost, Some(dec!(115)));
        assert_eq!(p.realized_pnl, Decimal::ZERO);
    }

    #[test]
    fn partial_sell_realizes_and_keeps_cost() {
        let mut p = flat();
        apply_fill(&mut p, Side::Buy, 10, dec!(100));
        let pnl = apply_fill(&mut p, Side::Sell, 4, dec!(110));
        assert_eq!(pnl, dec!(40));
        assert_eq!(p.quantity, 6);
        assert_eq!(p.average_cost, Some(dec!(100)));
    }

    #[test]
    fn closing_everything_clears_average_cost() {
        let mut p = flat();
        apply_fill(&mut p, Side::Buy, 10, dec!(100));
        let pnl = apply_fill(&mut p, Side::Sell, 10, dec!(98));
        assert_eq!(pnl, dec!(-20));
        assert_eq!(p.quantity, 0);
        assert_eq!(p.average_cost, None);
    }

    #[test]
    fn flip_realizes_closed_part_then_opens_fresh() {
        let mut p = flat();
        apply_fill(&mut p, Side::Buy, 10, dec!(100));
        let pnl = apply_fill(&mut p, Side::Sell, 15, dec!(90));
        assert_eq!(pnl, dec!(-100));
        assert_eq!(p.quantity, -5);
        assert_eq!(p.average_cost, Some(dec!(90)));

        // covering the short below cost is a gain
        let pnl = apply_fill(&mut p, Side::Buy, 5, dec!(80));
        assert_eq!(pnl, dec!(50));
        assert_eq!(p.quantity, 0);
        assert_eq!(p.realized_pnl, dec!(-50));
    }

    #[test]
    fn unrealized_tracks_sign() {
        let mut p = flat();
        apply_fill(&mut p, Side::Buy, 10, dec!(100));
        assert_eq!(unrealized(&p, dec!(103)), dec!(30));
        p = flat();
        apply_fill(&mut p, Side::Sell, 10, dec!(100));
        assert_eq!(unrealized(&p, dec!(103)), dec!(-30));
        assert_eq!(unrealized(&flat(), dec!(103)), Decimal::ZERO);
    }
}
