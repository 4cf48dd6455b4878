//! Lenient JSON field access for venue payloads.
//!
//! Venues disagree on whether numbers are JSON numbers or strings, and on
//! field names for the same concept; these helpers absorb both.

use serde_json::Value;

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Strings and numbers rendered as text; empty strings are absent.
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Booleans, or the strings "true"/"1"
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(matches!(s.trim().to_lowercase().as_str(), "true" | "1")),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        _ => None,
    }
}

/// First key present with a parseable number
pub fn first_f64(obj: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(as_f64))
}

pub fn first_i64(obj: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(as_i64))
}

pub fn first_string(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| obj.get(*k).and_then(as_string))
}

/// First key present with a non-zero number
pub fn first_nonzero_f64(obj: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(as_f64).filter(|v| *v != 0.0))
}

/// Elements under `key`, accepting either an array or a single object
pub fn items<'a>(root: &'a Value, key: &str) -> Vec<&'a Value> {
    match root.get(key) {
        Some(Value::Array(list)) => list.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numbers_and_strings() {
        assert_eq!(as_f64(&json!("1.5")), Some(1.5));
        assert_eq!(as_f64(&json!(2)), Some(2.0));
        assert_eq!(as_f64(&json!("")), None);
        assert_eq!(as_i64(&json!("1700000000000")), Some(1_700_000_000_000));
        assert_eq!(as_i64(&json!(1.7e9)), Some(1_700_000_000));
        assert_eq!(as_string(&json!(123)), Some("123".to_string()));
        assert_eq!(as_string(&json!("")), None);
    }

    #[test]
    fn test_bool_forms() {
        assert_eq!(as_bool(&json!(true)), Some(true));
        assert_eq!(as_bool(&json!("1")), Some(true));
        assert_eq!(as_bool(&json!("false")), Some(false));
        assert_eq!(as_bool(&json!(null)), None);
    }

    #[test]
    fn test_first_helpers_fall_through() {
        let obj = json!({"fillPnl": "0", "pnl": "", "realizedPnl": "3.5"});
        assert_eq!(first_f64(&obj, &["fillPnl", "pnl"]), Some(0.0));
        assert_eq!(
            first_nonzero_f64(&obj, &["fillPnl", "pnl", "realizedPnl"]),
            Some(3.5)
        );
        assert_eq!(items(&json!({"result": {"id": 1}}), "result").len(), 1);
        assert_eq!(items(&json!({"data": [1, 2]}), "data").len(), 2);
    }
}
