//! Global functions for Home Assistant templates

use chrono::{DateTime, Datelike, Timelike, Utc};
use minijinja::value::{Object, ObjectRepr, Value};
use minijinja::{Error, ErrorKind};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use crate::states::with_states;

/// A point in time exposed to templates
#[derive(Debug, Clone)]
pub struct DateTimeValue(pub DateTime<Utc>);

impl Object for DateTimeValue {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = key.as_str()?;
        match key {
            "year" => Some(Value::from(self.0.year())),
            "month" => Some(Value::from(self.0.month())),
            "day" => Some(Value::from(self.0.day())),
            "hour" => Some(Value::from(self.0.hour())),
            "minute" => Some(Value::from(self.0.minute())),
            "second" => Some(Value::from(self.0.second())),
            "weekday" => Some(Value::from(self.0.weekday().num_days_from_monday())),
            _ => None,
        }
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &minijinja::State,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match name {
            "isoformat" => Ok(Value::from(self.0.to_rfc3339())),
            "timestamp" => Ok(Value::from(self.0.timestamp_millis() as f64 / 1000.0)),
            "strftime" => {
                let format = args.first().and_then(|v| v.as_str()).ok_or_else(|| {
                    Error::new(ErrorKind::InvalidOperation, "strftime requires format string")
                })?;
                let mut out = String::new();
                write!(out, "{}", self.0.format(format)).map_err(|_| {
                    Error::new(
                        ErrorKind::InvalidOperation,
                        format!("invalid strftime format {:?}", format),
                    )
                })?;
                Ok(Value::from(out))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("datetime has no method named {}", name),
            )),
        }
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.f%:z"))
    }
}

/// `now()`, read from the hub clock
pub fn now(state: &minijinja::State) -> Result<Value, Error> {
    with_states(state, |states| Value::from_object(DateTimeValue(states.now())))
}

/// `utcnow()`
pub fn utcnow(state: &minijinja::State) -> Result<Value, Error> {
    now(state)
}

/// `iif(condition, if_true, if_false, if_none)`
pub fn iif(
    condition: Value,
    if_true: Option<Value>,
    if_false: Option<Value>,
    if_none: Option<Value>,
) -> Value {
    if condition.is_none() || condition.is_undefined() {
        if let Some(value) = if_none {
            return value;
        }
    }
    if condition.is_true() {
        if_true.unwrap_or(Value::from(true))
    } else {
        if_false.unwrap_or(Value::from(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iif() {
        assert_eq!(
            iif(Value::from(true), Some(Value::from("yes")), None, None).as_str(),
            Some("yes")
        );
        assert_eq!(
            iif(Value::from(()), None, Some(Value::from("no")), Some(Value::from("none"))).as_str(),
            Some("none")
        );
        assert!(!iif(Value::from(0), None, None, None).is_true());
    }
}
