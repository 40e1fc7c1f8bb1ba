//! Field-map encoding of cached indicator results.
//!
//! Each top-level field of an [`IndicatorResult`] is stored as its own
//! JSON-encoded hash field, so a partial or foreign entry fails to decode
//! instead of yielding a half-populated result.

use pulse_metrics::IndicatorResult;
use serde_json::{Map, Value};

use crate::error::{CacheError, Result};
use crate::store::FieldMap;

/// Encodes `result` into one hash field per top-level property.
///
/// # Errors
///
/// Returns [`CacheError::Codec`] if the result cannot be serialized.
pub fn encode(result: &IndicatorResult) -> Result<FieldMap> {
    let Value::Object(object) = serde_json::to_value(result)? else {
        return Err(CacheError::Codec {
            reason: "indicator result did not serialize to an object".to_string(),
        });
    };

    object
        .into_iter()
        .map(|(field, value)| -> Result<(String, String)> {
            Ok((field, serde_json::to_string(&value)?))
        })
        .collect()
}

/// Decodes a hash field map written by [`encode`].
///
/// # Errors
///
/// Returns [`CacheError::Codec`] if a field is not valid JSON or the fields
/// do not form a complete result.
pub fn decode(fields: &FieldMap) -> Result<IndicatorResult> {
    let object = fields
        .iter()
        .map(|(field, raw)| -> Result<(String, Value)> {
            Ok((field.clone(), serde_json::from_str(raw)?))
        })
        .collect::<Result<Map<String, Value>>>()?;
    Ok(serde_json::from_value(Value::Object(object))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_metrics::{Indicator, IndicatorKind, QpsIndicator};
    use rust_decimal::Decimal;

    fn qps(value: i64) -> IndicatorResult {
        IndicatorResult::fresh(
            Indicator::Qps(QpsIndicator {
                qps: Decimal::new(value, 2),
            }),
            1_000,
        )
    }

    #[test]
    fn one_field_per_property() {
        let fields = encode(&qps(1234)).unwrap();
        let mut names: Vec<_> = fields.keys().map(String::as_str).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            ["error", "indicator", "reset_detected", "time_diff_ms", "used_stale_result"]
        );
        assert_eq!(fields["time_diff_ms"], "1000");
        assert_eq!(fields["error"], "false");
    }

    #[test]
    fn decode_restores_stale_result() {
        let original = qps(50).into_stale(700);
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn missing_field_is_codec_error() {
        let mut fields = encode(&IndicatorResult::zero(IndicatorKind::Qps, 0)).unwrap();
        fields.remove("indicator");
        assert!(matches!(decode(&fields), Err(CacheError::Codec { .. })));
    }

    #[test]
    fn garbage_field_is_codec_error() {
        let mut fields = encode(&qps(1)).unwrap();
        fields.insert("time_diff_ms".to_string(), "not-json".to_string());
        assert!(matches!(decode(&fields), Err(CacheError::Codec { .. })));
    }
}
