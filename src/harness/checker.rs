/// Expected-output comparison.
///
/// Literal expectations use value equality with a floating-point tolerance
/// for numeric leaves, applied recursively through arrays and objects so a
/// list of floats compares the way a single float does.
use serde_json::Value;

/// Tolerance for numeric comparison: `|actual - expected| < 1e-9`.
pub const FLOAT_TOLERANCE: f64 = 1e-9;

/// Compare an actual value against a literal expectation.
pub fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(e)) => match (a.as_f64(), e.as_f64()) {
            (Some(a), Some(e)) => (a - e).abs() < FLOAT_TOLERANCE,
            _ => a == e,
        },
        (Value::Array(a), Value::Array(e)) => {
            a.len() == e.len() && a.iter().zip(e).all(|(a, e)| values_match(a, e))
        }
        (Value::Object(a), Value::Object(e)) => {
            a.len() == e.len()
                && a.iter().all(|(key, a_val)| {
                    e.get(key).map(|e_val| values_match(a_val, e_val)).unwrap_or(false)
                })
        }
        _ => actual == expected,
    }
}
