//! Event payload decoding.
//!
//! Payloads arrive either as flat JSON objects or in the chain's typed JSON
//! encoding (`{"type": "Event", "value": {"fields": [{"name", "value"}]}}`).
//! [`event_fields`] normalizes both into one flat map.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value};

use ledgermirror_core::error::IndexerError;
use ledgermirror_core::ledger::LedgerEvent;

/// Flat field map of an event payload. Non-object payloads are permanent errors.
pub fn event_fields(event: &LedgerEvent) -> Result<Map<String, Value>, IndexerError> {
    let root = event.fields()?;
    if root.contains_key("amount") {
        return Ok(root.clone());
    }
    match root.get("value").and_then(|v| v.get("fields")).and_then(Value::as_array) {
        Some(fields) => Ok(collect_fields(fields)),
        None => Ok(root.clone()),
    }
}

fn collect_fields(fields: &[Value]) -> Map<String, Value> {
    let mut out = Map::new();
    for field in fields {
        let Some(name) = field.get("name").and_then(Value::as_str) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        out.insert(name.to_string(), decode_typed(field.get("value").unwrap_or(&Value::Null)));
    }
    out
}

/// Strip the `{"type", "value"}` wrappers from a typed JSON value.
pub fn decode_typed(v: &Value) -> Value {
    let Some(obj) = v.as_object() else {
        return v.clone();
    };
    let Some(kind) = obj.get("type").and_then(Value::as_str) else {
        return v.clone();
    };
    let raw = obj.get("value").unwrap_or(&Value::Null);
    match kind {
        "Optional" => {
            if raw.is_null() {
                Value::Null
            } else {
                decode_typed(raw)
            }
        }
        "Array" => match raw.as_array() {
            Some(items) => Value::Array(items.iter().map(decode_typed).collect()),
            None => raw.clone(),
        },
        "Dictionary" => match raw.as_array() {
            Some(entries) => {
                let mut out = Map::new();
                for entry in entries {
                    let key = decode_typed(entry.get("key").unwrap_or(&Value::Null));
                    let key = match key {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    out.insert(key, decode_typed(entry.get("value").unwrap_or(&Value::Null)));
                }
                Value::Object(out)
            }
            None => raw.clone(),
        },
        "Struct" | "Resource" | "Event" => {
            match raw.get("fields").and_then(Value::as_array) {
                Some(fields) => Value::Object(collect_fields(fields)),
                None => raw.clone(),
            }
        }
        _ => raw.clone(),
    }
}

/// String or number field rendered as a string. Empty strings read as absent.
pub fn field_str(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty address among `keys`, normalized.
pub fn field_address(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| fields.get(*k).and_then(address_of))
}

fn address_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => normalize_address(s),
        Value::Object(obj) => obj
            .get("address")
            .or_else(|| obj.get("value"))
            .and_then(address_of),
        _ => None,
    }
}

/// Lowercase, trimmed, without a `0x` prefix. `None` for empty input.
pub fn normalize_address(addr: &str) -> Option<String> {
    let lower = addr.trim().to_ascii_lowercase();
    let bare = lower.strip_prefix("0x").unwrap_or(&lower);
    if bare.is_empty() {
        None
    } else {
        Some(bare.to_string())
    }
}

pub fn parse_amount(raw: &str) -> Result<Decimal, IndexerError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| IndexerError::permanent(format!("bad amount '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(payload: Value) -> LedgerEvent {
        LedgerEvent {
            block_height: 1,
            tx_id: "tx".into(),
            tx_index: 0,
            event_index: 0,
            event_type: "A.01.FlowToken.TokensDeposited".into(),
            payload,
        }
    }

    #[test]
    fn flat_payload_passes_through() {
        let f = event_fields(&event(json!({"amount": "1.5", "to": "0xABC"}))).unwrap();
        assert_eq!(field_str(&f, "amount").as_deref(), Some("1.5"));
        assert_eq!(field_address(&f, &["to"]).as_deref(), Some("abc"));
    }

    #[test]
    fn typed_payload_is_flattened() {
        let payload = json!({
            "type": "Event",
            "value": {
                "id": "A.01.FlowToken.TokensDeposited",
                "fields": [
                    {"name": "amount", "value": {"type": "UFix64", "value": "10.00000000"}},
                    {"name": "to", "value": {"type": "Optional", "value": {"type": "Address", "value": "0x0Ae53cb6e3f42a79"}}},
                    {"name": "from", "value": {"type": "Optional", "value": null}}
                ]
            }
        });
        let f = event_fields(&event(payload)).unwrap();
        assert_eq!(field_str(&f, "amount").as_deref(), Some("10.00000000"));
        assert_eq!(field_address(&f, &["to"]).as_deref(), Some("0ae53cb6e3f42a79"));
        assert_eq!(field_address(&f, &["from"]), None);
    }

    #[test]
    fn non_object_payload_is_permanent() {
        let err = event_fields(&event(json!("nope"))).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn amounts_parse_as_decimals() {
        assert_eq!(parse_amount("1.25").unwrap(), Decimal::new(125, 2));
        assert!(parse_amount("one").is_err());
    }
}
