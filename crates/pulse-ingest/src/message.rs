//! Wire and persisted forms of an indicator.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use pulse_metrics::{Indicator, IndicatorKind};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// An indicator in flight between producer and consumer.
///
/// `indicator` is optional on the wire so a message with a null or absent
/// body deserializes and can be dead-lettered as such.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedIndicator {
    /// Capture time in Unix milliseconds.
    pub timestamp: i64,
    /// Address of the monitored server, `a.b.c.d` or `a.b.c.d:port`.
    pub source_address: String,
    /// The indicator payload.
    #[serde(default)]
    pub indicator: Option<Indicator>,
}

impl QueuedIndicator {
    /// Wraps `indicator` for publishing.
    #[must_use]
    pub fn new(timestamp: i64, source_address: impl Into<String>, indicator: Indicator) -> Self {
        Self {
            timestamp,
            source_address: source_address.into(),
            indicator: Some(indicator),
        }
    }

    /// Serializes to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the payload cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| IngestError::Serialization {
            reason: e.to_string(),
        })
    }
}

/// A queued indicator that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIndicator {
    /// Capture time in Unix milliseconds.
    pub timestamp: i64,
    /// Source server IPv4 address as an integer.
    pub source_ip: u32,
    /// The indicator payload.
    pub indicator: Indicator,
}

/// One row of the historical `monitor_log` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorLogRecord {
    /// Snowflake id.
    pub id: i64,
    /// Capture time in Unix milliseconds.
    pub timestamp: i64,
    /// Indicator family.
    pub indicator_type: IndicatorKind,
    /// Source server IPv4 address as an integer.
    pub source_ip: u32,
    /// Indicator payload as JSON text.
    pub payload: String,
}

impl MonitorLogRecord {
    /// Builds a row from a validated indicator and a fresh id.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the payload cannot be encoded.
    pub fn from_validated(id: i64, validated: &ValidatedIndicator) -> Result<Self> {
        let payload =
            serde_json::to_string(&validated.indicator).map_err(|e| IngestError::Serialization {
                reason: e.to_string(),
            })?;
        Ok(Self {
            id,
            timestamp: validated.timestamp,
            indicator_type: validated.indicator.kind(),
            source_ip: validated.source_ip,
            payload,
        })
    }

    /// The source address in dotted form.
    #[must_use]
    pub fn source_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.source_ip)
    }

    /// Capture time as a UTC datetime, if the timestamp is in range.
    #[must_use]
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_metrics::QpsIndicator;
    use rust_decimal::Decimal;

    fn qps() -> Indicator {
        Indicator::Qps(QpsIndicator {
            qps: Decimal::new(1250, 2),
        })
    }

    #[test]
    fn wire_format_is_tagged_json() {
        let msg = QueuedIndicator::new(1_700_000_000_000, "10.0.0.5:3306", qps());
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(json["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(json["source_address"], "10.0.0.5:3306");
        assert_eq!(json["indicator"]["type"], "qps");
    }

    #[test]
    fn absent_indicator_deserializes_as_none() {
        let msg: QueuedIndicator =
            serde_json::from_str(r#"{"timestamp":1,"source_address":"10.0.0.1"}"#).unwrap();
        assert!(msg.indicator.is_none());
    }

    #[test]
    fn record_carries_kind_and_payload() {
        let validated = ValidatedIndicator {
            timestamp: 42,
            source_ip: u32::from(Ipv4Addr::new(192, 168, 1, 10)),
            indicator: qps(),
        };
        let record = MonitorLogRecord::from_validated(7, &validated).unwrap();

        assert_eq!(record.id, 7);
        assert_eq!(record.indicator_type, IndicatorKind::Qps);
        assert_eq!(record.source_addr(), Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(record.captured_at().unwrap().timestamp_millis(), 42);
        let back: Indicator = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(back, qps());
    }
}
