//! Order-update decoding for every supported venue.
//!
//! Each venue's private order push is mapped onto [`ExchangeOrder`] with the
//! status normalized to one vocabulary (NEW, PARTIALLY_FILLED, FILLED,
//! CANCELED, ...). The venue's own status survives in `raw_status`, and
//! `is_open` is decided from it.

use crate::domain::entities::market::{normalize_timestamp_ms, ExchangeOrder};
use crate::domain::entities::order::{OrderSide, PositionSide};
use crate::domain::entities::platform::{canonical_symbol, Platform};
use crate::domain::services::payload::{
    as_bool, first_f64, first_i64, first_string, items,
};
use serde_json::Value;
use tracing::debug;

/// Maps a venue status onto the common vocabulary
pub fn normalize_order_status(platform: Platform, raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let mapped = match platform {
        Platform::Binance => None,
        Platform::Okx => match upper.as_str() {
            "LIVE" => Some("NEW"),
            "CANCELLED" | "CANCELED" | "MMP_CANCELED" => Some("CANCELED"),
            _ => None,
        },
        Platform::Gate => match upper.as_str() {
            "OPEN" => Some("NEW"),
            "FINISHED" => Some("FILLED"),
            "CANCELLED" | "CANCELED" => Some("CANCELED"),
            _ => None,
        },
        Platform::Bitget => match upper.as_str() {
            "LIVE" | "NEW" | "INIT" => Some("NEW"),
            "PARTIAL_FILL" | "PARTIALLY_FILLED" | "PARTIAL-FILL" => Some("PARTIALLY_FILLED"),
            "FULL_FILL" | "FULL-FILL" => Some("FILLED"),
            "CANCELLED" | "CANCELED" => Some("CANCELED"),
            _ => None,
        },
    };
    mapped.map(str::to_string).unwrap_or(upper)
}

/// Whether the venue status describes a resting order
pub fn is_open_status(platform: Platform, raw: &str) -> bool {
    let upper = raw.trim().to_uppercase();
    match platform {
        Platform::Binance => matches!(upper.as_str(), "NEW" | "PARTIALLY_FILLED"),
        Platform::Okx => matches!(upper.as_str(), "LIVE" | "PARTIALLY_FILLED"),
        Platform::Gate => upper == "OPEN",
        Platform::Bitget => matches!(
            upper.as_str(),
            "LIVE" | "NEW" | "INIT" | "PARTIALLY_FILLED" | "PARTIAL_FILL" | "PARTIAL-FILL"
        ),
    }
}

/// Decodes every order carried by one private push. Malformed entries are skipped.
pub fn parse_order_events(platform: Platform, payload: &[u8]) -> Vec<ExchangeOrder> {
    let root: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            debug!("Ignoring undecodable {} order payload: {}", platform, e);
            return Vec::new();
        }
    };

    match platform {
        Platform::Binance => parse_binance(&root).into_iter().collect(),
        Platform::Okx => items(&root, "data")
            .into_iter()
            .filter_map(parse_okx_order)
            .collect(),
        Platform::Gate => items(&root, "result")
            .into_iter()
            .filter_map(parse_gate_order)
            .collect(),
        Platform::Bitget => items(&root, "data")
            .into_iter()
            .filter_map(parse_bitget_order)
            .collect(),
    }
}

fn parse_side(raw: Option<String>) -> Option<OrderSide> {
    raw.and_then(|s| s.parse::<OrderSide>().ok())
}

fn parse_binance(root: &Value) -> Option<ExchangeOrder> {
    let o = root.get("o")?;
    let order_id = first_string(o, &["i"])?;
    let side = parse_side(first_string(o, &["S"]))?;
    let raw_status = first_string(o, &["X"]).unwrap_or_default();
    let event_time = first_i64(root, &["E", "T"]).unwrap_or_default();
    let trade_time = first_i64(o, &["T"]).unwrap_or(event_time);

    Some(ExchangeOrder {
        order_id,
        client_order_id: first_string(o, &["c"]),
        symbol: canonical_symbol(&first_string(o, &["s"]).unwrap_or_default()),
        side,
        position_side: first_string(o, &["ps"]).and_then(|s| PositionSide::parse_venue(&s)),
        order_type: first_string(o, &["o"]).unwrap_or_default().to_uppercase(),
        reduce_only: o.get("R").and_then(as_bool).unwrap_or(false),
        price: first_f64(o, &["p"]).unwrap_or(0.0),
        quantity: first_f64(o, &["q"]).unwrap_or(0.0),
        filled_quantity: first_f64(o, &["z"]).unwrap_or(0.0),
        avg_price: first_f64(o, &["ap"]).unwrap_or(0.0),
        status: normalize_order_status(Platform::Binance, &raw_status),
        is_open: is_open_status(Platform::Binance, &raw_status),
        raw_status,
        create_time_ms: normalize_timestamp_ms(trade_time),
        update_time_ms: normalize_timestamp_ms(event_time.max(trade_time)),
    })
}

fn parse_okx_order(d: &Value) -> Option<ExchangeOrder> {
    let order_id = first_string(d, &["ordId"])?;
    let side = parse_side(first_string(d, &["side"]))?;
    let raw_status = first_string(d, &["state"]).unwrap_or_default();
    let create = first_i64(d, &["cTime"]).unwrap_or_default();

    Some(ExchangeOrder {
        order_id,
        client_order_id: first_string(d, &["clOrdId"]),
        symbol: canonical_symbol(&first_string(d, &["instId"]).unwrap_or_default()),
        side,
        position_side: first_string(d, &["posSide"]).and_then(|s| PositionSide::parse_venue(&s)),
        order_type: first_string(d, &["ordType"]).unwrap_or_default().to_uppercase(),
        reduce_only: d.get("reduceOnly").and_then(as_bool).unwrap_or(false),
        price: first_f64(d, &["px"]).unwrap_or(0.0),
        quantity: first_f64(d, &["sz"]).unwrap_or(0.0),
        filled_quantity: first_f64(d, &["accFillSz"]).unwrap_or(0.0),
        avg_price: first_f64(d, &["avgPx"]).unwrap_or(0.0),
        status: normalize_order_status(Platform::Okx, &raw_status),
        is_open: is_open_status(Platform::Okx, &raw_status),
        raw_status,
        create_time_ms: normalize_timestamp_ms(create),
        update_time_ms: normalize_timestamp_ms(first_i64(d, &["uTime"]).unwrap_or(create)),
    })
}

fn parse_gate_order(r: &Value) -> Option<ExchangeOrder> {
    let order_id = first_string(r, &["id"])?;
    let size = first_f64(r, &["size"]).unwrap_or(0.0);
    let side = if size < 0.0 {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    };
    let quantity = size.abs();
    let filled = match (first_f64(r, &["left"]), first_f64(r, &["filled_size"])) {
        (Some(left), _) => (quantity - left.abs()).max(0.0),
        (None, Some(filled)) => filled.abs(),
        (None, None) => 0.0,
    };
    let raw_status = first_string(r, &["status"]).unwrap_or_default();
    let mut status = normalize_order_status(Platform::Gate, &raw_status);
    if status == "FILLED" && filled <= 0.0 {
        // finished without any fill means the order was cancelled
        status = "CANCELED".to_string();
    } else if status == "FILLED" && filled < quantity {
        status = "PARTIALLY_FILLED".to_string();
    }
    let reduce_only = ["is_reduce_only", "reduce_only"]
        .iter()
        .find_map(|k| r.get(*k).and_then(as_bool))
        .unwrap_or(false);
    let create = first_i64(r, &["create_time_ms", "create_time"]).unwrap_or_default();
    let update = first_i64(r, &["update_time", "finish_time_ms", "finish_time"]).unwrap_or(create);

    Some(ExchangeOrder {
        order_id,
        client_order_id: first_string(r, &["text"]),
        symbol: canonical_symbol(&first_string(r, &["contract"]).unwrap_or_default()),
        side,
        position_side: first_string(r, &["pos_side", "position_side", "posSide"])
            .and_then(|s| PositionSide::parse_venue(&s)),
        order_type: if first_f64(r, &["price"]).unwrap_or(0.0) > 0.0 {
            "LIMIT".to_string()
        } else {
            "MARKET".to_string()
        },
        reduce_only,
        price: first_f64(r, &["price"]).unwrap_or(0.0),
        quantity,
        filled_quantity: filled,
        avg_price: first_f64(r, &["fill_price"]).unwrap_or(0.0),
        is_open: is_open_status(Platform::Gate, &raw_status),
        status,
        raw_status,
        create_time_ms: normalize_timestamp_ms(create),
        update_time_ms: normalize_timestamp_ms(update),
    })
}

fn parse_bitget_order(d: &Value) -> Option<ExchangeOrder> {
    let order_id = first_string(d, &["orderId", "ordId"])?;
    let side = parse_side(first_string(d, &["side"]))?;
    let raw_status = first_string(d, &["status", "state"]).unwrap_or_default();
    let trade_side = first_string(d, &["tradeSide"]).unwrap_or_default().to_lowercase();
    let reduce_only = trade_side == "close"
        || d.get("reduceOnly")
            .and_then(|v| match v.as_str() {
                Some(s) => Some(matches!(s.to_lowercase().as_str(), "yes" | "true" | "1")),
                None => as_bool(v),
            })
            .unwrap_or(false);
    let create = first_i64(d, &["cTime"]).unwrap_or_default();

    Some(ExchangeOrder {
        order_id,
        client_order_id: first_string(d, &["clientOid", "clOrdId"]),
        symbol: canonical_symbol(&first_string(d, &["instId", "symbol"]).unwrap_or_default()),
        side,
        position_side: first_string(d, &["posSide", "holdSide"])
            .and_then(|s| PositionSide::parse_venue(&s)),
        order_type: first_string(d, &["orderType", "ordType"])
            .unwrap_or_default()
            .to_uppercase(),
        reduce_only,
        price: first_f64(d, &["price", "px"]).unwrap_or(0.0),
        quantity: first_f64(d, &["size", "sz"]).unwrap_or(0.0),
        filled_quantity: first_f64(d, &["accBaseVolume", "fillSz", "baseVolume"]).unwrap_or(0.0),
        avg_price: first_f64(d, &["priceAvg", "avgPx"]).unwrap_or(0.0),
        status: normalize_order_status(Platform::Bitget, &raw_status),
        is_open: is_open_status(Platform::Bitget, &raw_status),
        raw_status,
        create_time_ms: normalize_timestamp_ms(create),
        update_time_ms: normalize_timestamp_ms(first_i64(d, &["uTime"]).unwrap_or(create)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_status_normalization_table() {
        assert_eq!(normalize_order_status(Platform::Okx, "live"), "NEW");
        assert_eq!(normalize_order_status(Platform::Okx, "filled"), "FILLED");
        assert_eq!(normalize_order_status(Platform::Okx, "cancelled"), "CANCELED");
        assert_eq!(normalize_order_status(Platform::Gate, "open"), "NEW");
        assert_eq!(normalize_order_status(Platform::Gate, "finished"), "FILLED");
        assert_eq!(normalize_order_status(Platform::Bitget, "live"), "NEW");
        assert_eq!(normalize_order_status(Platform::Bitget, "partially_filled"), "PARTIALLY_FILLED");
        assert_eq!(normalize_order_status(Platform::Binance, "expired"), "EXPIRED");
    }

    #[test]
    fn test_open_status_per_platform() {
        assert!(is_open_status(Platform::Binance, "PARTIALLY_FILLED"));
        assert!(!is_open_status(Platform::Binance, "FILLED"));
        assert!(is_open_status(Platform::Okx, "live"));
        assert!(is_open_status(Platform::Gate, "open"));
        assert!(!is_open_status(Platform::Gate, "finished"));
        assert!(is_open_status(Platform::Bitget, "new"));
    }

    #[test]
    fn test_parse_binance_order_trade_update() {
        let payload = bytes(json!({
            "e": "ORDER_TRADE_UPDATE",
            "E": 1700000000500i64,
            "o": {
                "s": "BTCUSDT", "c": "rb1L1", "S": "BUY", "o": "MARKET",
                "q": "0.010", "p": "0", "ap": "50000", "X": "FILLED",
                "i": 8886774, "z": "0.010", "T": 1700000000400i64,
                "R": false, "ps": "LONG"
            }
        }));
        let orders = parse_order_events(Platform::Binance, &payload);
        assert_eq!(orders.len(), 1);
        let order = &orders[0];
        assert_eq!(order.order_id, "8886774");
        assert_eq!(order.client_order_id.as_deref(), Some("rb1L1"));
        assert_eq!(order.position_side, Some(PositionSide::Long));
        assert_eq!(order.status, "FILLED");
        assert!(!order.is_open);
        assert!(order.has_fill());
        assert!(order.opens(PositionSide::Long));
        assert_eq!(order.update_time_ms, 1700000000500);
    }

    #[test]
    fn test_parse_okx_orders() {
        let payload = bytes(json!({
            "arg": {"channel": "orders", "instType": "SWAP"},
            "data": [{
                "instId": "BTC-USDT-SWAP", "ordId": "312269865356374016",
                "clOrdId": "", "side": "buy", "posSide": "long",
                "ordType": "market", "reduceOnly": "false", "px": "",
                "sz": "0.01", "accFillSz": "0.01", "avgPx": "50000",
                "state": "filled", "cTime": "1700000000000", "uTime": "1700000000100"
            }]
        }));
        let orders = parse_order_events(Platform::Okx, &payload);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].symbol, "BTCUSDT");
        assert_eq!(orders[0].client_order_id, None);
        assert_eq!(orders[0].filled_quantity, 0.01);
        assert_eq!(orders[0].status, "FILLED");
    }

    #[test]
    fn test_parse_gate_signed_size_and_seconds() {
        let payload = bytes(json!({
            "channel": "futures.orders",
            "event": "update",
            "result": [{
                "id": 3001, "contract": "BTC_USDT", "size": -10, "left": 4,
                "price": "0", "fill_price": "50100", "status": "finished",
                "text": "t-rb1", "create_time": 1700000000, "finish_time": 1700000005,
                "is_reduce_only": false
            }]
        }));
        let orders = parse_order_events(Platform::Gate, &payload);
        assert_eq!(orders.len(), 1);
        let order = &orders[0];
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.quantity, 10.0);
        assert_eq!(order.filled_quantity, 6.0);
        assert_eq!(order.status, "PARTIALLY_FILLED");
        assert_eq!(order.create_time_ms, 1_700_000_000_000);
        assert_eq!(order.leg(), PositionSide::Short);
    }

    #[test]
    fn test_gate_finished_without_fill_is_canceled() {
        let payload = bytes(json!({
            "result": {"id": "9", "contract": "ETH_USDT", "size": 5, "left": 5, "status": "finished"}
        }));
        let orders = parse_order_events(Platform::Gate, &payload);
        assert_eq!(orders[0].status, "CANCELED");
        assert!(orders[0].is_terminal_without_fill());
    }

    #[test]
    fn test_parse_bitget_close_is_reduce_only() {
        let payload = bytes(json!({
            "arg": {"instType": "USDT-FUTURES", "channel": "orders", "instId": "default"},
            "data": [{
                "instId": "BTCUSDT", "orderId": "77", "clientOid": "c77",
                "side": "sell", "posSide": "long", "tradeSide": "close",
                "orderType": "market", "size": "0.02", "accBaseVolume": "0.02",
                "priceAvg": "51000", "status": "filled", "cTime": "1700000000000"
            }]
        }));
        let orders = parse_order_events(Platform::Bitget, &payload);
        assert_eq!(orders.len(), 1);
        assert!(orders[0].reduce_only);
        assert!(!orders[0].opens(PositionSide::Long));
        assert_eq!(orders[0].fill_price(), 51000.0);
    }

    #[test]
    fn test_malformed_payloads_are_skipped() {
        assert!(parse_order_events(Platform::Okx, b"not json").is_empty());
        let payload = bytes(json!({"data": [{"ordId": "1", "side": "sideways"}]}));
        assert!(parse_order_events(Platform::Okx, &payload).is_empty());
    }
}
