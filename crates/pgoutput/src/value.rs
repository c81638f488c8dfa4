//! Conversion of PostgreSQL text-format values into JSON values
//!
//! `pgoutput` sends column values in their text output format. The decoder
//! for a column is selected by its type OID; unknown types are kept as text.

use base64::Engine;
use chrono::{DateTime, NaiveDateTime};
use serde_json::{Number, Value};

/// Built-in type OIDs understood by [`decode_text`]
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const DATE: u32 = 1082;
    pub const TIME: u32 = 1083;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;

    pub const BOOL_ARRAY: u32 = 1000;
    pub const INT2_ARRAY: u32 = 1005;
    pub const INT4_ARRAY: u32 = 1007;
    pub const TEXT_ARRAY: u32 = 1009;
    pub const VARCHAR_ARRAY: u32 = 1015;
    pub const INT8_ARRAY: u32 = 1016;
    pub const FLOAT4_ARRAY: u32 = 1021;
    pub const FLOAT8_ARRAY: u32 = 1022;
    pub const UUID_ARRAY: u32 = 2951;
}

/// Decodes a value in PostgreSQL text format according to its type OID.
pub fn decode_text(type_oid: u32, text: &str) -> Result<Value, String> {
    match array_element(type_oid) {
        Some(element_oid) => parse_array(text, element_oid),
        None => decode_scalar(type_oid, text),
    }
}

fn decode_scalar(type_oid: u32, text: &str) -> Result<Value, String> {
    match type_oid {
        oid::BOOL => match text {
            "t" | "true" => Ok(Value::Bool(true)),
            "f" | "false" => Ok(Value::Bool(false)),
            other => Err(format!("invalid boolean {other:?}")),
        },
        oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => text
            .parse::<i64>()
            .map(|v| Value::Number(v.into()))
            .map_err(|e| format!("invalid integer {text:?}: {e}")),
        oid::FLOAT4 | oid::FLOAT8 => {
            let v = text
                .parse::<f64>()
                .map_err(|e| format!("invalid float {text:?}: {e}"))?;
            // NaN and infinities have no JSON representation
            Ok(Number::from_f64(v)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(text.to_string())))
        }
        // Kept as a string to preserve precision
        oid::NUMERIC => Ok(Value::String(text.to_string())),
        oid::JSON | oid::JSONB => {
            serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))
        }
        oid::BYTEA => decode_bytea(text),
        oid::TIMESTAMP => Ok(Value::String(normalize_timestamp(text))),
        oid::TIMESTAMPTZ => Ok(Value::String(normalize_timestamptz(text))),
        oid::UUID => {
            let parsed = uuid::Uuid::parse_str(text)
                .map_err(|e| format!("invalid uuid {text:?}: {e}"))?;
            Ok(Value::String(parsed.hyphenated().to_string()))
        }
        _ => Ok(Value::String(text.to_string())),
    }
}

fn array_element(type_oid: u32) -> Option<u32> {
    match type_oid {
        oid::BOOL_ARRAY => Some(oid::BOOL),
        oid::INT2_ARRAY => Some(oid::INT2),
        oid::INT4_ARRAY => Some(oid::INT4),
        oid::INT8_ARRAY => Some(oid::INT8),
        oid::TEXT_ARRAY => Some(oid::TEXT),
        oid::VARCHAR_ARRAY => Some(oid::VARCHAR),
        oid::FLOAT4_ARRAY => Some(oid::FLOAT4),
        oid::FLOAT8_ARRAY => Some(oid::FLOAT8),
        oid::UUID_ARRAY => Some(oid::UUID),
        _ => None,
    }
}

/// Bytea in hex output format (`\x0102`) becomes a base64 string.
fn decode_bytea(text: &str) -> Result<Value, String> {
    let hex_str = text
        .strip_prefix("\\x")
        .ok_or_else(|| format!("unsupported bytea format {text:?}"))?;
    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid bytea hex: {e}"))?;
    Ok(Value::String(
        base64::engine::general_purpose::STANDARD.encode(bytes),
    ))
}

/// `2024-01-15 10:30:00` becomes `2024-01-15T10:30:00`.
/// Values chrono cannot represent (`infinity`) are kept verbatim.
fn normalize_timestamp(text: &str) -> String {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return naive.format("%Y-%m-%dT%H:%M:%S%.f").to_string();
        }
    }
    text.to_string()
}

/// `2024-01-15 10:30:00+02` becomes RFC 3339 `2024-01-15T10:30:00+02:00`.
fn normalize_timestamptz(text: &str) -> String {
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return dt.to_rfc3339();
        }
    }
    text.to_string()
}

/// Parses a one-dimensional array literal such as `{1,2,NULL}` or
/// `{"a b","c\"d"}`.
fn parse_array(text: &str, element_oid: u32) -> Result<Value, String> {
    let inner = text
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| format!("invalid array literal {text:?}"))?;
    if inner.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }

    let mut elements = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        let mut item = String::new();
        let quoted = chars.peek() == Some(&'"');
        if quoted {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => {
                        let escaped = chars
                            .next()
                            .ok_or_else(|| format!("dangling escape in {text:?}"))?;
                        item.push(escaped);
                    }
                    Some('"') => break,
                    Some(c) => item.push(c),
                    None => return Err(format!("unterminated quote in {text:?}")),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                if *c == '{' {
                    return Err("multi-dimensional arrays are not supported".to_string());
                }
                item.push(*c);
                chars.next();
            }
        }

        if !quoted && item == "NULL" {
            elements.push(Value::Null);
        } else {
            elements.push(decode_scalar(element_oid, &item)?);
        }

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => return Err(format!("unexpected {c:?} in array literal {text:?}")),
        }
    }
    Ok(Value::Array(elements))
}
