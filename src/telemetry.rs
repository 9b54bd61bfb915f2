use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("payload is not a well-formed JSON object: {0}")]
    Malformed(String),
    #[error("field `{field}` expected a number, got {found}")]
    TypeMismatch { field: &'static str, found: String },
}

/// Recognized readings extracted from one payload. A missing field is simply
/// `None`; a present-but-non-numeric field is omitted and recorded in
/// `mismatches` so the rest of the payload still decodes.
#[derive(Debug, Default)]
pub struct DecodedReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub unit: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub mismatches: Vec<DecodeError>,
}

pub fn decode(payload: &[u8]) -> Result<DecodedReading, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let value: Value =
        serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::Malformed("top level is not an object".to_string()));
    };

    let mut reading = DecodedReading::default();
    match numeric_field(&obj, "temperature") {
        Ok(value) => reading.temperature = value,
        Err(err) => reading.mismatches.push(err),
    }
    match numeric_field(&obj, "humidity") {
        Ok(value) => reading.humidity = value,
        Err(err) => reading.mismatches.push(err),
    }
    reading.unit = obj
        .get("unit")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string());
    reading.timestamp = obj.get("timestamp").and_then(parse_timestamp);

    Ok(reading)
}

/// Numeric coercion: JSON numbers and numeric-looking strings both parse as
/// f64, matching what the publishing firmware sends in either form.
fn numeric_field(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(raw)) => raw.trim().parse::<f64>().map(Some).map_err(|_| {
            DecodeError::TypeMismatch {
                field,
                found: format!("\"{raw}\""),
            }
        }),
        Some(other) => Err(DecodeError::TypeMismatch {
            field,
            found: other.to_string(),
        }),
    }
}

/// Source timestamps arrive as RFC 3339 strings or epoch seconds (integer or
/// fractional). Anything unparseable is treated as absent, not an error.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                DateTime::from_timestamp(secs, 0)
            } else {
                n.as_f64()
                    .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64))
            }
        }
        _ => None,
    }
}
