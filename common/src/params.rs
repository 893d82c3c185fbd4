//! Request parameter coercion. RPC payloads arrive as JSON where numbers and
//! booleans are routinely passed as strings; every façade entry point funnels
//! its loosely-typed fields through these helpers before touching the store.

use serde_json::Value;

use crate::error::{Error, Result};

const TRUTHY: &[&str] = &["1", "t", "true", "on", "y", "yes"];
const FALSY: &[&str] = &["0", "f", "false", "off", "n", "no"];

#[derive(Debug, Clone, Copy)]
pub struct IntRule {
    pub allow_zero: bool,
    pub allow_negative: bool,
    pub upper_limit: Option<i64>,
}

impl Default for IntRule {
    fn default() -> Self {
        IntRule {
            allow_zero: true,
            allow_negative: false,
            upper_limit: None,
        }
    }
}

impl IntRule {
    pub fn nonzero(mut self) -> Self {
        self.allow_zero = false;
        self
    }

    pub fn negative_ok(mut self) -> Self {
        self.allow_negative = true;
        self
    }

    pub fn at_most(mut self, limit: i64) -> Self {
        self.upper_limit = Some(limit);
        self
    }
}

fn invalid(name: &str, value: &Value) -> Error {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Error::InvalidParameter {
        name: name.to_string(),
        value: rendered,
    }
}

/// Coerce an optional integer parameter. `Null` and absent map to `None`;
/// strings are trimmed and parsed; floats are rejected.
pub fn parse_int_param(name: &str, value: &Value, rule: IntRule) -> Result<Option<i64>> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_i64().ok_or_else(|| invalid(name, value))?,
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(name, value))?,
        _ => return Err(invalid(name, value)),
    };

    if parsed == 0 && !rule.allow_zero {
        return Err(invalid(name, value));
    }
    if parsed < 0 && !rule.allow_negative {
        return Err(invalid(name, value));
    }
    if let Some(limit) = rule.upper_limit
        && parsed > limit
    {
        return Err(invalid(name, value));
    }
    Ok(Some(parsed))
}

/// Coerce an optional boolean parameter from a JSON bool or a truthy/falsy
/// string. Unrecognized strings are an error, not `false`.
pub fn parse_bool_param(name: &str, value: &Value) -> Result<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        Value::String(s) => {
            let lowered = s.trim().to_lowercase();
            if TRUTHY.contains(&lowered.as_str()) {
                Ok(Some(true))
            } else if FALSY.contains(&lowered.as_str()) {
                Ok(Some(false))
            } else {
                Err(invalid(name, value))
            }
        }
        _ => Err(invalid(name, value)),
    }
}

/// Coerce an optional float parameter (used by percentage adjustments).
pub fn parse_float_param(name: &str, value: &Value) -> Result<Option<f64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| invalid(name, value)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| invalid(name, value)),
        _ => Err(invalid(name, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ints_accept_numbers_and_strings() {
        let rule = IntRule::default();
        assert_eq!(parse_int_param("limit", &json!(5), rule).unwrap(), Some(5));
        assert_eq!(
            parse_int_param("limit", &json!(" 12 "), rule).unwrap(),
            Some(12)
        );
        assert_eq!(parse_int_param("limit", &Value::Null, rule).unwrap(), None);
    }

    #[test]
    fn ints_reject_floats_and_garbage() {
        let rule = IntRule::default();
        assert!(parse_int_param("limit", &json!(1.5), rule).is_err());
        assert!(parse_int_param("limit", &json!("five"), rule).is_err());
        assert!(parse_int_param("limit", &json!([1]), rule).is_err());
    }

    #[test]
    fn int_rules_are_enforced() {
        assert!(parse_int_param("count", &json!(0), IntRule::default().nonzero()).is_err());
        assert!(parse_int_param("count", &json!(-2), IntRule::default()).is_err());
        assert_eq!(
            parse_int_param("delta", &json!(-2), IntRule::default().negative_ok()).unwrap(),
            Some(-2)
        );
        assert!(parse_int_param("level", &json!(101), IntRule::default().at_most(100)).is_err());
        assert_eq!(
            parse_int_param("level", &json!(100), IntRule::default().at_most(100)).unwrap(),
            Some(100)
        );
    }

    #[test]
    fn bools_accept_truthy_and_falsy_strings() {
        assert_eq!(
            parse_bool_param("strict", &json!("Yes")).unwrap(),
            Some(true)
        );
        assert_eq!(
            parse_bool_param("strict", &json!("off")).unwrap(),
            Some(false)
        );
        assert_eq!(parse_bool_param("strict", &json!(false)).unwrap(), Some(false));
        assert_eq!(parse_bool_param("strict", &Value::Null).unwrap(), None);
        assert!(parse_bool_param("strict", &json!("maybe")).is_err());
    }

    #[test]
    fn floats_accept_both_representations() {
        assert_eq!(
            parse_float_param("number", &json!(-50)).unwrap(),
            Some(-50.0)
        );
        assert_eq!(
            parse_float_param("number", &json!("2.5")).unwrap(),
            Some(2.5)
        );
        assert!(parse_float_param("number", &json!({})).is_err());
    }
}
