//! Fill extraction from private order pushes.
//!
//! Some venues report per-fill data on the order channel (Binance, OKX,
//! Bitget); Gate only reports cumulative order progress there, so a Gate
//! order update with fills asks for a trade-history backfill instead.

use crate::domain::entities::market::{normalize_timestamp_ms, Trade};
use crate::domain::entities::order::{OrderSide, PositionSide};
use crate::domain::entities::platform::{canonical_symbol, Platform};
use crate::domain::services::payload::{
    first_f64, first_i64, first_nonzero_f64, first_string, items,
};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillExtraction {
    pub trades: Vec<Trade>,
    /// Fills happened but pnl, fee or trade id must come from trade history
    pub needs_backfill: bool,
}

pub fn parse_fills(platform: Platform, payload: &[u8]) -> FillExtraction {
    let root: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(_) => return FillExtraction::default(),
    };

    match platform {
        Platform::Binance => binance_fills(&root),
        Platform::Okx => okx_fills(&root),
        Platform::Gate => gate_fills(&root),
        Platform::Bitget => bitget_fills(&root),
    }
}

fn side_of(obj: &Value, key: &str) -> Option<OrderSide> {
    first_string(obj, &[key]).and_then(|s| s.parse().ok())
}

fn pos_side_of(obj: &Value, keys: &[&str]) -> Option<PositionSide> {
    first_string(obj, keys).and_then(|s| PositionSide::parse_venue(&s))
}

fn binance_fills(root: &Value) -> FillExtraction {
    let mut out = FillExtraction::default();
    let Some(o) = root.get("o") else {
        return out;
    };
    let qty = first_f64(o, &["l"]).unwrap_or(0.0);
    let price = first_f64(o, &["L"]).unwrap_or(0.0);
    let (Some(order_id), Some(side)) = (first_string(o, &["i"]), side_of(o, "S")) else {
        return out;
    };
    if qty <= 0.0 || price <= 0.0 {
        return out;
    }

    out.trades.push(Trade {
        trade_id: first_string(o, &["t"]).filter(|t| t != "0"),
        order_id,
        symbol: canonical_symbol(&first_string(o, &["s"]).unwrap_or_default()),
        side,
        position_side: pos_side_of(o, &["ps"]),
        price,
        quantity: qty,
        realized_pnl: first_f64(o, &["rp"]).unwrap_or(0.0),
        fee: first_f64(o, &["n"]).unwrap_or(0.0).abs(),
        fee_currency: first_string(o, &["N"]).unwrap_or_default(),
        timestamp_ms: normalize_timestamp_ms(
            first_i64(o, &["T"]).or_else(|| first_i64(root, &["E"])).unwrap_or_default(),
        ),
    });
    out
}

fn okx_fills(root: &Value) -> FillExtraction {
    let mut out = FillExtraction::default();
    for d in items(root, "data") {
        let price = first_f64(d, &["fillPx"]).unwrap_or(0.0);
        let qty = first_f64(d, &["fillSz"]).unwrap_or(0.0).abs();
        if price <= 0.0 || qty <= 0.0 {
            continue;
        }
        let (Some(order_id), Some(side)) = (first_string(d, &["ordId"]), side_of(d, "side")) else {
            continue;
        };
        out.trades.push(Trade {
            trade_id: first_string(d, &["fillId", "tradeId", "billId"]),
            order_id,
            symbol: canonical_symbol(&first_string(d, &["instId"]).unwrap_or_default()),
            side,
            position_side: pos_side_of(d, &["posSide"]),
            price,
            quantity: qty,
            realized_pnl: first_nonzero_f64(d, &["fillPnl", "pnl", "realizedPnl"]).unwrap_or(0.0),
            fee: first_f64(d, &["fillFee", "fee"]).unwrap_or(0.0).abs(),
            fee_currency: first_string(d, &["fillFeeCcy", "feeCcy"]).unwrap_or_default(),
            timestamp_ms: normalize_timestamp_ms(
                first_i64(d, &["fillTime", "uTime", "cTime"]).unwrap_or_default(),
            ),
        });
    }
    out
}

fn gate_fills(root: &Value) -> FillExtraction {
    let mut out = FillExtraction::default();
    let channel = first_string(root, &["channel"]).unwrap_or_default();
    let push_time = first_i64(root, &["time_ms", "time"]).unwrap_or_default();

    for r in items(root, "result") {
        if channel == "futures.usertrades" {
            let size = first_f64(r, &["size"]).unwrap_or(0.0);
            let price = first_f64(r, &["price"]).unwrap_or(0.0);
            let Some(order_id) = first_string(r, &["order_id"]) else {
                continue;
            };
            if size == 0.0 || price <= 0.0 {
                continue;
            }
            let fee = first_f64(r, &["fee"]).unwrap_or(0.0).abs();
            out.trades.push(Trade {
                trade_id: first_string(r, &["id", "trade_id"]),
                order_id,
                symbol: canonical_symbol(&first_string(r, &["contract"]).unwrap_or_default()),
                side: if size < 0.0 { OrderSide::Sell } else { OrderSide::Buy },
                position_side: None,
                price,
                quantity: size.abs(),
                realized_pnl: 0.0,
                fee,
                fee_currency: "USDT".to_string(),
                timestamp_ms: normalize_timestamp_ms(
                    first_i64(r, &["create_time_ms", "create_time"]).unwrap_or(push_time),
                ),
            });
            // user trades carry no realized pnl
            out.needs_backfill = true;
        } else {
            let fill_price = first_f64(r, &["fill_price"]).unwrap_or(0.0);
            let size = first_f64(r, &["size"]).unwrap_or(0.0).abs();
            let left = first_f64(r, &["left"]).unwrap_or(size).abs();
            if fill_price > 0.0 && size - left > 0.0 {
                out.needs_backfill = true;
            }
        }
    }
    out
}

fn bitget_fills(root: &Value) -> FillExtraction {
    let mut out = FillExtraction::default();
    for d in items(root, "data") {
        let price = first_f64(d, &["fillPrice"]).unwrap_or(0.0);
        let qty = first_f64(d, &["baseVolume", "fillSz"]).unwrap_or(0.0).abs();
        if price <= 0.0 || qty <= 0.0 {
            continue;
        }
        let (Some(order_id), Some(side)) =
            (first_string(d, &["orderId", "ordId"]), side_of(d, "side"))
        else {
            continue;
        };
        let fee_detail = d
            .get("feeDetail")
            .and_then(|v| v.as_array())
            .and_then(|list| list.first());
        let fee = first_f64(d, &["fillFee"])
            .or_else(|| fee_detail.and_then(|f| first_f64(f, &["fee", "totalFee"])))
            .unwrap_or(0.0)
            .abs();
        let fee_currency = first_string(d, &["fillFeeCoin"])
            .or_else(|| fee_detail.and_then(|f| first_string(f, &["feeCoin"])))
            .unwrap_or_default();
        let trade_id = first_string(d, &["tradeId"]);
        if trade_id.is_none() {
            out.needs_backfill = true;
        }

        out.trades.push(Trade {
            trade_id,
            order_id,
            symbol: canonical_symbol(&first_string(d, &["instId", "symbol"]).unwrap_or_default()),
            side,
            position_side: pos_side_of(d, &["posSide", "holdSide"]),
            price,
            quantity: qty,
            realized_pnl: first_nonzero_f64(d, &["pnl", "totalProfits"]).unwrap_or(0.0),
            fee,
            fee_currency,
            timestamp_ms: normalize_timestamp_ms(
                first_i64(d, &["fillTime", "uTime", "cTime"]).unwrap_or_default(),
            ),
        });
    }
    out
}
