//! Position and balance snapshots from private account pushes.

use crate::domain::entities::market::{Balance, Position, POSITION_EPSILON};
use crate::domain::entities::order::PositionSide;
use crate::domain::entities::platform::{canonical_symbol, Platform};
use crate::domain::services::payload::{first_f64, first_string, items};
use serde_json::Value;

/// Positions reported by one push, plus the symbols that push speaks for.
///
/// A covered symbol with no entry in `positions` is flat on both legs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionUpdate {
    pub symbols: Vec<String>,
    pub positions: Vec<Position>,
    /// The venue sent every open position, so absence means flat everywhere
    pub full_snapshot: bool,
}

impl PositionUpdate {
    pub fn covers(&self, symbol: &str) -> bool {
        let symbol = canonical_symbol(symbol);
        self.full_snapshot || self.symbols.iter().any(|s| *s == symbol)
    }

    pub fn positions_for(&self, symbol: &str) -> Vec<Position> {
        let symbol = canonical_symbol(symbol);
        self.positions
            .iter()
            .filter(|p| p.symbol == symbol && p.is_open())
            .cloned()
            .collect()
    }
}

pub fn parse_position_update(platform: Platform, payload: &[u8]) -> Option<PositionUpdate> {
    let root: Value = serde_json::from_slice(payload).ok()?;
    match platform {
        Platform::Binance => binance_positions(&root),
        Platform::Okx => okx_positions(&root),
        Platform::Gate => gate_positions(&root),
        Platform::Bitget => bitget_positions(&root),
    }
}

pub fn parse_balance_update(platform: Platform, payload: &[u8]) -> Option<Balance> {
    let root: Value = serde_json::from_slice(payload).ok()?;
    match platform {
        Platform::Binance => {
            let entry = items(root.get("a")?, "B")
                .into_iter()
                .find(|b| first_string(b, &["a"]).as_deref() == Some("USDT"))?;
            Some(Balance {
                currency: "USDT".to_string(),
                available: first_f64(entry, &["cw", "wb"])?,
                total: first_f64(entry, &["wb"])?,
            })
        }
        Platform::Okx => {
            let data = items(&root, "data").into_iter().next()?;
            let detail = data
                .get("details")
                .and_then(|d| d.as_array())
                .and_then(|list| {
                    list.iter()
                        .find(|d| first_string(d, &["ccy"]).as_deref() == Some("USDT"))
                });
            let total = detail
                .and_then(|d| first_f64(d, &["eq"]))
                .or_else(|| first_f64(data, &["totalEq"]))?;
            Some(Balance {
                currency: "USDT".to_string(),
                available: detail
                    .and_then(|d| first_f64(d, &["availEq", "availBal"]))
                    .unwrap_or(total),
                total,
            })
        }
        Platform::Gate => {
            let entry = items(&root, "result").into_iter().next()?;
            let balance = first_f64(entry, &["balance"])?;
            Some(Balance {
                currency: first_string(entry, &["currency"])
                    .unwrap_or_else(|| "USDT".to_string())
                    .to_uppercase(),
                available: first_f64(entry, &["available"]).unwrap_or(balance),
                total: balance,
            })
        }
        Platform::Bitget => {
            let entry = items(&root, "data").into_iter().find(|d| {
                first_string(d, &["marginCoin"])
                    .map(|c| c.eq_ignore_ascii_case("USDT"))
                    .unwrap_or(true)
            })?;
            let total = first_f64(entry, &["usdtEquity", "equity", "accountEquity"])?;
            Some(Balance {
                currency: "USDT".to_string(),
                available: first_f64(entry, &["available", "crossedMaxAvailable"]).unwrap_or(total),
                total,
            })
        }
    }
}

fn push_symbol(symbols: &mut Vec<String>, symbol: &str) {
    if !symbols.iter().any(|s| s == symbol) {
        symbols.push(symbol.to_string());
    }
}

fn binance_positions(root: &Value) -> Option<PositionUpdate> {
    let account = root.get("a")?;
    let mut update = PositionUpdate::default();
    for p in items(account, "P") {
        let Some(raw_symbol) = first_string(p, &["s"]) else {
            continue;
        };
        let symbol = canonical_symbol(&raw_symbol);
        push_symbol(&mut update.symbols, &symbol);

        let amount = first_f64(p, &["pa"]).unwrap_or(0.0);
        if amount.abs() <= POSITION_EPSILON {
            continue;
        }
        let side = first_string(p, &["ps"])
            .and_then(|s| PositionSide::parse_venue(&s))
            .unwrap_or_else(|| PositionSide::from_signed_amount(amount));
        let margin_mode = first_string(p, &["mt"]).unwrap_or_else(|| "cross".to_string());
        let margin = if margin_mode.eq_ignore_ascii_case("isolated") {
            first_f64(p, &["iw"]).unwrap_or(0.0)
        } else {
            0.0
        };

        update.positions.push(Position {
            symbol,
            side,
            amount: amount.abs(),
            entry_price: first_f64(p, &["ep"]).unwrap_or(0.0),
            mark_price: first_f64(p, &["mp"]).unwrap_or(0.0),
            unrealized_pnl: first_f64(p, &["up"]).unwrap_or(0.0),
            leverage: first_f64(p, &["l"]).unwrap_or(0.0),
            margin,
            margin_mode,
        });
    }
    if update.symbols.is_empty() {
        return None;
    }
    Some(update)
}

fn okx_positions(root: &Value) -> Option<PositionUpdate> {
    let channel = root
        .get("arg")
        .and_then(|a| first_string(a, &["channel"]))
        .unwrap_or_default();
    if channel != "positions" {
        return None;
    }
    let mut update = PositionUpdate::default();
    for d in items(root, "data") {
        let Some(inst) = first_string(d, &["instId"]) else {
            continue;
        };
        let symbol = canonical_symbol(&inst);
        push_symbol(&mut update.symbols, &symbol);

        let pos = first_f64(d, &["pos"]).unwrap_or(0.0);
        if pos.abs() <= POSITION_EPSILON {
            continue;
        }
        let side = first_string(d, &["posSide"])
            .and_then(|s| PositionSide::parse_venue(&s))
            .unwrap_or_else(|| PositionSide::from_signed_amount(pos));
        update.positions.push(Position {
            symbol,
            side,
            amount: pos.abs(),
            entry_price: first_f64(d, &["avgPx"]).unwrap_or(0.0),
            mark_price: first_f64(d, &["markPx", "last"]).unwrap_or(0.0),
            unrealized_pnl: first_f64(d, &["upl"]).unwrap_or(0.0),
            leverage: first_f64(d, &["lever"]).unwrap_or(0.0),
            margin: first_f64(d, &["margin", "imr"]).unwrap_or(0.0),
            margin_mode: first_string(d, &["mgnMode"]).unwrap_or_default(),
        });
    }
    Some(update)
}

fn gate_positions(root: &Value) -> Option<PositionUpdate> {
    if first_string(root, &["channel"]).as_deref() != Some("futures.positions") {
        return None;
    }
    let mut update = PositionUpdate::default();
    for r in items(root, "result") {
        let Some(contract) = first_string(r, &["contract"]) else {
            continue;
        };
        let symbol = canonical_symbol(&contract);
        push_symbol(&mut update.symbols, &symbol);

        let size = first_f64(r, &["size"]).unwrap_or(0.0);
        if size.abs() <= POSITION_EPSILON {
            continue;
        }
        let side = match first_string(r, &["mode"]).as_deref() {
            Some("dual_long") => PositionSide::Long,
            Some("dual_short") => PositionSide::Short,
            _ => PositionSide::from_signed_amount(size),
        };
        update.positions.push(Position {
            symbol,
            side,
            amount: size.abs(),
            entry_price: first_f64(r, &["entry_price"]).unwrap_or(0.0),
            mark_price: first_f64(r, &["mark_price"]).unwrap_or(0.0),
            unrealized_pnl: first_f64(r, &["unrealised_pnl", "unrealized_pnl"]).unwrap_or(0.0),
            leverage: first_f64(r, &["leverage"]).unwrap_or(0.0),
            margin: first_f64(r, &["margin"]).unwrap_or(0.0),
            margin_mode: if first_f64(r, &["leverage"]).unwrap_or(0.0) == 0.0 {
                "cross".to_string()
            } else {
                "isolated".to_string()
            },
        });
    }
    Some(update)
}

fn bitget_positions(root: &Value) -> Option<PositionUpdate> {
    let channel = root
        .get("arg")
        .and_then(|a| first_string(a, &["channel"]))
        .unwrap_or_default();
    if channel != "positions" {
        return None;
    }
    let mut update = PositionUpdate {
        full_snapshot: true,
        ..PositionUpdate::default()
    };
    for d in items(root, "data") {
        let Some(inst) = first_string(d, &["instId", "symbol"]) else {
            continue;
        };
        let symbol = canonical_symbol(&inst);
        push_symbol(&mut update.symbols, &symbol);

        let total = first_f64(d, &["total"]).unwrap_or(0.0);
        let Some(side) = first_string(d, &["holdSide", "posSide"])
            .and_then(|s| PositionSide::parse_venue(&s))
        else {
            continue;
        };
        if total.abs() <= POSITION_EPSILON {
            continue;
        }
        update.positions.push(Position {
            symbol,
            side,
            amount: total.abs(),
            entry_price: first_f64(d, &["openPriceAvg", "averageOpenPrice"]).unwrap_or(0.0),
            mark_price: first_f64(d, &["markPrice"]).unwrap_or(0.0),
            unrealized_pnl: first_f64(d, &["unrealizedPL", "upl"]).unwrap_or(0.0),
            leverage: first_f64(d, &["leverage"]).unwrap_or(0.0),
            margin: first_f64(d, &["marginSize", "margin"]).unwrap_or(0.0),
            margin_mode: first_string(d, &["marginMode"]).unwrap_or_default(),
        });
    }
    Some(update)
}
