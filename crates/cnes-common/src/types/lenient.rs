//! Tolerant deserializers for code-like fields.
//!
//! Public datasets mix `150010` and `"150010"` for the same column.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Render a JSON scalar as a code string.
///
/// Strings are trimmed, integral numbers are printed without a fraction.
/// Blank strings, fractional numbers, and non-scalars give `None`.
pub fn value_to_code(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        },
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.is_finite())
                    .map(|f| format!("{:.0}", f))
            }
        },
        _ => None,
    }
}

pub(super) fn code<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_code).unwrap_or_default())
}

pub(super) fn opt_code<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_code))
}

pub(super) fn opt_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(value_to_code)
        .and_then(|code| code.parse().ok()))
}
