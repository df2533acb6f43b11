// src/normalize/transforms.rs

//! Total scalar transforms. Each maps possibly-missing text to a typed
//! value; `Err` carries the reason a non-empty input was rejected.

use super::date_parser::parse_date;
use crate::config::Transform;
use crate::store::{SqlType, Value};
use once_cell::sync::Lazy;
use regex::Regex;

static CURRENCY_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\$€£¥₴,\s]").expect("currency regex should compile"));

/// Trim whitespace, strip outer quotes and the given characters.
pub fn clean_str(raw: &str, strip: Option<&str>) -> String {
    let trimmed = raw.trim();
    let unquoted = if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    match strip {
        Some(chars) if !chars.is_empty() => unquoted
            .chars()
            .filter(|c| !chars.contains(*c))
            .collect::<String>()
            .trim()
            .to_string(),
        _ => unquoted.to_string(),
    }
}

/// SQL type a transform produces.
pub fn output_type(transform: &Transform) -> SqlType {
    match transform {
        Transform::Text => SqlType::Text,
        Transform::Number { .. } | Transform::Currency | Transform::Percent => SqlType::Double,
        Transform::Integer | Transform::Flag { .. } => SqlType::BigInt,
        Transform::Date { .. } => SqlType::Date,
    }
}

fn parse_float(s: &str) -> Result<f64, String> {
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| "not a number".to_string())
}

/// Apply `transform` to already-cleaned text (`None` when the column is absent).
pub fn apply(transform: &Transform, input: Option<&str>) -> Result<Value, String> {
    if let Transform::Flag { truthy } = transform {
        let hit = input.map(|s| truthy.iter().any(|t| t == s)).unwrap_or(false);
        return Ok(Value::Int(hit as i64));
    }

    let text = match input {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(Value::Null),
    };

    match transform {
        Transform::Text => Ok(Value::Text(text.to_string())),
        Transform::Number { decimal_comma } => {
            let s = if *decimal_comma {
                text.replace(',', ".")
            } else {
                text.to_string()
            };
            let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
            parse_float(&s).map(Value::Float)
        }
        Transform::Integer => {
            if let Ok(v) = text.parse::<i64>() {
                return Ok(Value::Int(v));
            }
            // "2012.0" style exports of integer columns
            match text.parse::<f64>() {
                Ok(v)
                    if v.is_finite()
                        && v.fract() == 0.0
                        && v >= i64::MIN as f64
                        && v < i64::MAX as f64 =>
                {
                    Ok(Value::Int(v as i64))
                }
                _ => Err("not an integer".to_string()),
            }
        }
        Transform::Currency => {
            let s = CURRENCY_NOISE.replace_all(text, "");
            if s.is_empty() {
                return Ok(Value::Null);
            }
            parse_float(&s).map(Value::Float)
        }
        Transform::Percent => {
            let s = text.trim_end_matches('%').trim();
            if s.is_empty() {
                return Ok(Value::Null);
            }
            parse_float(s).map(Value::Float)
        }
        Transform::Date { formats } => parse_date(text, formats)
            .map(Value::Date)
            .ok_or_else(|| "not a recognised date".to_string()),
        Transform::Flag { .. } => unreachable!("handled above"),
    }
}
