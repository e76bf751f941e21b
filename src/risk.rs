// ===============================
// src/risk.rs
// ===============================
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::config::Limits;
use crate::domain::{Bracket, BracketKind, Exchange, OrderDraft, PositionKey, Side};
use crate::error::{EngineError, EngineResult};
use crate::metrics::ORDERS_REJECTED;

/// Raw bracket leg as sent by clients.
#[derive(Debug, Clone, Deserialize)]
pub struct BracketRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub value: Option<Decimal>,
}

/// Placement request. Accepts the nested `takeProfit: {type, value}` form as well as the
/// flat `takeProfitType` / `takeProfitValue` pairs; `orderType` is an alias of `side`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: String,
    #[serde(alias = "orderType")]
    pub side: String,
    pub quantity: i64,
    pub limit_price: Decimal,
    #[serde(default)]
    pub take_profit: Option<BracketRequest>,
    #[serde(default)]
    pub stop_loss: Option<BracketRequest>,
    #[serde(default)]
    pub take_profit_type: Option<String>,
    #[serde(default)]
    pub take_profit_value: Option<Decimal>,
    #[serde(default)]
    pub stop_loss_type: Option<String>,
    #[serde(default)]
    pub stop_loss_value: Option<Decimal>,
}

fn invalid(msg: impl Into<String>) -> EngineError { EngineError::Validation(msg.into()) }

fn parse_side(s: &str) -> EngineResult<Side> {
    match s.trim().to_ascii_uppercase().as_str() {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(invalid(format!("side must be BUY or SELL, got {other:?}"))),
    }
}

fn parse_kind(s: Option<&str>) -> EngineResult<BracketKind> {
    match s.map(|x| x.trim().to_ascii_uppercase()).as_deref() {
        None | Some("PERCENTAGE") => Ok(BracketKind::Percentage),
        Some("ABSOLUTE") => Ok(BracketKind::Absolute),
        Some(other) => Err(invalid(format!("bracket type must be PERCENTAGE or ABSOLUTE, got {other:?}"))),
    }
}

/// A zero or missing value means "no bracket", the way the order form submits it.
fn bracket(
    name: &str,
    nested: Option<&BracketRequest>,
    flat_kind: Option<&str>,
    flat_value: Option<Decimal>,
    limit_price: Decimal,
    lim: &Limits,
) -> EngineResult<Option<Bracket>> {
    let (kind, value) = match nested {
        Some(b) => (b.kind.as_deref(), b.value),
        None => (flat_kind, flat_value),
    };
    let value = match value {
        None => return Ok(None),
        Some(v) if v.is_zero() => return Ok(None),
        Some(v) => v,
    };
    if value.is_sign_negative() {
        return Err(invalid(format!("{name} value must be positive")));
    }
    let kind = parse_kind(kind)?;
    match kind {
        BracketKind::Percentage if value > lim.max_bracket_pct => {
            return Err(invalid(format!("{name} percentage must be <= {}", lim.max_bracket_pct)));
        }
        BracketKind::Percentage => {}
        BracketKind::Absolute => {
            // same reach as the percentage cap, measured from the limit price
            let cap = limit_price
                .checked_mul(lim.max_bracket_pct)
                .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
                .ok_or_else(|| invalid(format!("{name} value out of range")))?;
            if value > cap {
                return Err(invalid(format!("{name} offset must be <= {cap}")));
            }
        }
    }
    Ok(Some(Bracket { kind, value }))
}

/// Pre-trade checks on the request alone. Funds and position checks need the ledger and
/// happen inside the placement transaction.
pub fn validate(req: &OrderRequest, lim: &Limits) -> EngineResult<OrderDraft> {
    let res = check(req, lim);
    if let Err(e) = &res {
        warn!(symbol = %req.symbol, error = %e, "order rejected");
        ORDERS_REJECTED.with_label_values(&[e.kind()]).inc();
    }
    res
}

fn check(req: &OrderRequest, lim: &Limits) -> EngineResult<OrderDraft> {
    // 1) instrument
    let symbol = req.symbol.trim();
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric() || "-&_.".contains(c)) {
        return Err(invalid("symbol is required"));
    }
    let exchange = Exchange::parse(&req.exchange)
        .ok_or_else(|| invalid(format!("exchange must be NSE or BSE, got {:?}", req.exchange)))?;
    let side = parse_side(&req.side)?;

    // 2) size & price
    if req.quantity <= 0 {
        return Err(invalid("quantity must be greater than 0"));
    }
    let quantity = req.quantity as u64;
    if quantity > lim.max_order_qty {
        return Err(invalid(format!("quantity must be <= {}", lim.max_order_qty)));
    }
    if req.limit_price <= Decimal::ZERO {
        return Err(invalid("limit price must be greater than 0"));
    }
    match req.limit_price.checked_mul(Decimal::from(quantity)) {
        Some(notional) if notional <= lim.max_notional => {}
        _ => return Err(invalid(format!("notional must be <= {}", lim.max_notional))),
    }

    // 3) brackets
    let take_profit = bracket(
        "take profit",
        req.take_profit.as_ref(),
        req.take_profit_type.as_deref(),
        req.take_profit_value,
        req.limit_price,
        lim,
    )?;
    let stop_loss = bracket(
        "stop loss",
        req.stop_loss.as_ref(),
        req.stop_loss_type.as_deref(),
        req.stop_loss_value,
        req.limit_price,
        lim,
    )?;

    Ok(OrderDraft {
        key: PositionKey::new(symbol, exchange),
        side,
        quantity,
        limit_price: req.limit_price,
        take_profit,
        stop_loss,
    })
}
