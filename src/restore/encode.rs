// restoretool/src/restore/encode.rs
//! Renders NDJSON values as SQL literals for a target column type.
//!
//! Encoding never fails: a value that cannot be represented in its column's
//! type becomes `NULL` (or text, where text is still meaningful).

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use super::column_types::{ColumnType, SqlType};
use crate::utils::quote_literal;

pub fn encode_value(value: &Value, column_type: Option<&ColumnType>) -> String {
    if value.is_null() {
        return "NULL".to_string();
    }
    match column_type {
        None => encode_untyped(value),
        Some(ColumnType::Jsonb) => json_literal(value, "jsonb"),
        Some(ColumnType::ArrayOf(base)) => encode_array(value, base),
        Some(ColumnType::Scalar(ty)) => encode_scalar(value, ty),
    }
}

/// Columns the catalog did not describe: JSON-ish values go in as jsonb,
/// everything else as the closest plain literal.
fn encode_untyped(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => bool_keyword(*b).to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(_) | Value::Object(_) => json_literal(value, "jsonb"),
    }
}

fn encode_scalar(value: &Value, ty: &SqlType) -> String {
    match ty {
        t if t.is_numeric() => encode_number(value, t).unwrap_or_else(|| "NULL".to_string()),
        SqlType::Boolean => encode_boolean(value).to_string(),
        SqlType::Uuid => encode_uuid(value),
        SqlType::Json => json_literal(value, "json"),
        SqlType::Jsonb => json_literal(value, "jsonb"),
        _ => encode_text(value),
    }
}

fn encode_number(value: &Value, ty: &SqlType) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::String(s) => numeric_from_text(s.trim(), ty),
        _ => None,
    }
}

/// Accepts numeric text the column can take. Floats take anything `f64`
/// parses except `NaN` and infinities; integers and decimals go through
/// `Decimal`, with plain digit runs too long for it passed through as-is.
fn numeric_from_text(text: &str, ty: &SqlType) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    if matches!(ty, SqlType::Real | SqlType::DoublePrecision) {
        return text
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(|_| text.to_string());
    }
    let decimal = Decimal::from_str(text).or_else(|_| Decimal::from_scientific(text));
    if let Ok(decimal) = decimal {
        if ty.is_integer() && !decimal.fract().is_zero() {
            return None;
        }
        return Some(decimal.to_string());
    }
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        return Some(text.to_string());
    }
    None
}

fn encode_boolean(value: &Value) -> &'static str {
    match value {
        Value::Bool(b) => bool_keyword(*b),
        Value::Number(n) => match n.as_f64() {
            Some(f) => bool_keyword(f != 0.0),
            None => "NULL",
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" | "on" => "TRUE",
            "false" | "f" | "0" | "no" | "n" | "off" => "FALSE",
            _ => "NULL",
        },
        _ => "NULL",
    }
}

fn bool_keyword(b: bool) -> &'static str {
    if b { "TRUE" } else { "FALSE" }
}

fn encode_uuid(value: &Value) -> String {
    match value.as_str().and_then(|s| Uuid::parse_str(s.trim()).ok()) {
        Some(id) => quote_literal(&id.hyphenated().to_string()),
        None => "NULL".to_string(),
    }
}

fn encode_text(value: &Value) -> String {
    match value {
        Value::String(s) => quote_literal(s),
        Value::Bool(b) => quote_literal(if *b { "true" } else { "false" }),
        Value::Number(n) => quote_literal(&n.to_string()),
        other => quote_literal(&other.to_string()),
    }
}

fn json_literal(value: &Value, cast: &str) -> String {
    format!("{}::{}", quote_literal(&value.to_string()), cast)
}

fn encode_array(value: &Value, base: &SqlType) -> String {
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('[') {
                match serde_json::from_str::<Vec<Value>>(trimmed) {
                    Ok(items) => items,
                    Err(_) => return "NULL".to_string(),
                }
            } else if trimmed.starts_with('{') && trimmed.ends_with('}') {
                // Already in Postgres array-literal form.
                return format!("{}::{}[]", quote_literal(trimmed), base.sql_name());
            } else {
                return "NULL".to_string();
            }
        }
        _ => return "NULL".to_string(),
    };

    if items.is_empty() {
        return format!("ARRAY[]::{}[]", base.sql_name());
    }
    let elements: Vec<String> = items.iter().map(|item| encode_element(item, base)).collect();
    format!("ARRAY[{}]::{}[]", elements.join(", "), base.sql_name())
}

fn encode_element(item: &Value, base: &SqlType) -> String {
    if item.is_null() {
        return "NULL".to_string();
    }
    match base {
        SqlType::Jsonb => json_literal(item, "jsonb"),
        SqlType::Json => json_literal(item, "json"),
        other => encode_scalar(item, other),
    }
}
