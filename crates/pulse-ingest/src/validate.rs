//! Validation of consumed message bodies.
//!
//! Every failure here is a data-validity failure: the message is
//! dead-lettered and never retried.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{IngestError, Result};
use crate::message::{QueuedIndicator, ValidatedIndicator};

/// Parses `a.b.c.d` or `a.b.c.d:port` into its integer form.
///
/// # Errors
///
/// Returns `InvalidAddress` for anything else, including host names and IPv6.
pub fn parse_source_ip(address: &str) -> Result<u32> {
    let trimmed = address.trim();
    let ip = trimmed
        .parse::<Ipv4Addr>()
        .or_else(|_| trimmed.parse::<SocketAddrV4>().map(|sock| *sock.ip()))
        .map_err(|_| IngestError::InvalidAddress {
            address: address.to_string(),
        })?;
    Ok(u32::from(ip))
}

/// Decodes and validates a message body.
///
/// # Errors
///
/// Returns `Malformed`, `MissingIndicator` or `InvalidAddress`.
pub fn validate(body: &[u8]) -> Result<ValidatedIndicator> {
    let message: QueuedIndicator =
        serde_json::from_slice(body).map_err(|e| IngestError::Malformed {
            reason: e.to_string(),
        })?;
    let indicator = message.indicator.ok_or(IngestError::MissingIndicator)?;
    let source_ip = parse_source_ip(&message.source_address)?;

    Ok(ValidatedIndicator {
        timestamp: message.timestamp,
        source_ip,
        indicator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_metrics::{Indicator, IndicatorKind};
    use test_case::test_case;

    #[test_case("10.0.0.1", 0x0A00_0001 ; "bare")]
    #[test_case("10.0.0.1:3306", 0x0A00_0001 ; "with port")]
    #[test_case(" 192.168.0.254 ", 0xC0A8_00FE ; "trimmed")]
    #[test_case("255.255.255.255", u32::MAX ; "broadcast")]
    fn accepts_ipv4(address: &str, expected: u32) {
        assert_eq!(parse_source_ip(address).unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("db.internal" ; "hostname")]
    #[test_case("256.0.0.1" ; "octet out of range")]
    #[test_case("10.0.0" ; "short")]
    #[test_case("::1" ; "ipv6")]
    #[test_case("10.0.0.1:99999" ; "port out of range")]
    fn rejects_non_ipv4(address: &str) {
        assert!(matches!(
            parse_source_ip(address),
            Err(IngestError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn valid_message_passes() {
        let body = QueuedIndicator::new(5, "10.0.0.1", Indicator::zero(IndicatorKind::Qps))
            .to_bytes()
            .unwrap();
        let validated = validate(&body).unwrap();
        assert_eq!(validated.timestamp, 5);
        assert_eq!(validated.indicator.kind(), IndicatorKind::Qps);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(validate(b"{not json"), Err(IngestError::Malformed { .. })));
    }

    #[test]
    fn unknown_indicator_type_is_malformed() {
        let body = br#"{"timestamp":1,"source_address":"10.0.0.1","indicator":{"type":"uptime","data":{}}}"#;
        assert!(matches!(validate(body), Err(IngestError::Malformed { .. })));
    }

    #[test]
    fn null_indicator_is_missing() {
        let body = br#"{"timestamp":1,"source_address":"10.0.0.1","indicator":null}"#;
        assert!(matches!(validate(body), Err(IngestError::MissingIndicator)));
    }

    #[test]
    fn bad_address_is_rejected() {
        let body = QueuedIndicator::new(1, "primary-db", Indicator::zero(IndicatorKind::Qps))
            .to_bytes()
            .unwrap();
        assert!(matches!(validate(&body), Err(IngestError::InvalidAddress { .. })));
    }
}
