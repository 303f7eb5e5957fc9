//! Custom Jinja2 filters for Home Assistant templates
//!
//! These filters extend minijinja with Home Assistant-specific functionality.

use minijinja::value::{Kwargs, Value};
use minijinja::{Error, ErrorKind};
use regex::Regex;
use std::convert::TryFrom;

/// Helper to convert Value to f64
fn value_to_f64(value: &Value) -> Option<f64> {
    f64::try_from(value.clone())
        .ok()
        .or_else(|| value.as_i64().map(|i| i as f64))
}

fn compile(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("invalid regex: {}", e)))
}

// ==================== String Filters ====================

/// Replace matches of a regex pattern with a replacement string
pub fn regex_replace(value: &str, find: &str, replace: &str) -> Result<String, Error> {
    Ok(compile(find)?.replace_all(value, replace).to_string())
}

/// Find all matches of a regex pattern
pub fn regex_findall(value: &str, pattern: &str) -> Result<Value, Error> {
    let matches: Vec<Value> = compile(pattern)?
        .find_iter(value)
        .map(|m| Value::from(m.as_str()))
        .collect();
    Ok(Value::from(matches))
}

/// Test if a regex pattern matches at the start of the value
pub fn regex_match(value: &str, pattern: &str) -> Result<bool, Error> {
    Ok(compile(pattern)?
        .find(value)
        .is_some_and(|m| m.start() == 0))
}

/// Test if a regex pattern matches anywhere in the value
pub fn regex_search(value: &str, pattern: &str) -> Result<bool, Error> {
    Ok(compile(pattern)?.is_match(value))
}

// ==================== Type Conversion Filters ====================

/// Convert value to float, falling back to `default` (or 0.0)
pub fn to_float(value: Value, default: Option<Value>) -> Result<Value, Error> {
    let parsed = value_to_f64(&value).or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()));
    match (parsed, default) {
        (Some(f), _) => Ok(Value::from(f)),
        (None, Some(d)) => Ok(d),
        (None, None) if value.is_undefined() || value.is_none() => Ok(Value::from(0.0)),
        (None, None) => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("cannot convert {} to float", value),
        )),
    }
}

/// Convert value to integer, falling back to `default` (or 0)
pub fn to_int(value: Value, default: Option<Value>) -> Result<Value, Error> {
    let parsed = value.as_i64().or_else(|| value_to_f64(&value).map(|f| f as i64)).or_else(|| {
        value.as_str().and_then(|s| {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        })
    });
    match (parsed, default) {
        (Some(i), _) => Ok(Value::from(i)),
        (None, Some(d)) => Ok(d),
        (None, None) if value.is_undefined() || value.is_none() => Ok(Value::from(0)),
        (None, None) => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("cannot convert {} to int", value),
        )),
    }
}

/// Convert value to boolean
pub fn to_bool(value: Value, default: Option<bool>) -> bool {
    if value.is_undefined() || value.is_none() {
        return default.unwrap_or(false);
    }
    if let Ok(b) = bool::try_from(value.clone()) {
        return b;
    }
    if let Some(s) = value.as_str() {
        return matches!(
            s.to_lowercase().as_str(),
            "true" | "yes" | "on" | "1" | "enable" | "enabled"
        );
    }
    value.is_true()
}

// ==================== Type Checking ====================

/// Check if value is a number, or a string holding one
pub fn is_number(value: Value) -> bool {
    if value.as_i64().is_some() || value_to_f64(&value).is_some() {
        return true;
    }
    value
        .as_str()
        .is_some_and(|s| s.trim().parse::<f64>().is_ok_and(f64::is_finite))
}

/// Check if a value contains another value
pub fn contains(value: Value, search: Value) -> bool {
    if let (Some(haystack), Some(needle)) = (value.as_str(), search.as_str()) {
        return haystack.contains(needle);
    }
    value
        .try_iter()
        .map(|mut items| items.any(|item| item == search))
        .unwrap_or(false)
}

// ==================== Math Filters ====================

/// Round a number to specified precision
pub fn round_filter(value: f64, precision: Option<i32>, kwargs: Kwargs) -> Result<f64, Error> {
    let precision = precision.unwrap_or(0);
    let method: String = kwargs
        .get::<Option<String>>("method")?
        .unwrap_or_else(|| "common".to_string());
    kwargs.assert_all_used()?;

    let multiplier = 10_f64.powi(precision);
    let scaled = value * multiplier;

    let rounded = match method.as_str() {
        "ceil" => scaled.ceil(),
        "floor" => scaled.floor(),
        "half" => (scaled * 2.0).round() / 2.0,
        _ => scaled.round(),
    };

    Ok(rounded / multiplier)
}

// ==================== JSON Filters ====================

/// Convert value to JSON string
pub fn to_json(value: Value, kwargs: Kwargs) -> Result<String, Error> {
    let pretty: bool = kwargs.get::<Option<bool>>("pretty")?.unwrap_or(false);
    kwargs.assert_all_used()?;

    if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("JSON error: {}", e)))
}

/// Parse JSON string to value
pub fn from_json(value: &str) -> Result<Value, Error> {
    let json: serde_json::Value = serde_json::from_str(value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("invalid JSON: {}", e)))?;
    Ok(Value::from_serialize(&json))
}
