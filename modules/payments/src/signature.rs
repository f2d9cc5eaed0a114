//! Webhook signature verification
//!
//! Header format: `t={unix_timestamp},v1={hex hmac}` where the MAC is
//! HMAC-SHA256 over `"{timestamp}.{raw_body}"`. Verification happens before
//! the body is parsed; an unverified payload is never interpreted.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between the signed timestamp and now.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing")]
    MissingHeader,

    #[error("signature header is malformed")]
    MalformedHeader,

    #[error("signed timestamp outside tolerance")]
    TimestampOutOfRange,

    #[error("signature mismatch")]
    Mismatch,
}

/// Verify a webhook delivery against its signature header.
///
/// Comparison is constant-time via the MAC's own verifier.
pub fn verify_signature(
    body: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let (timestamp, provided) = parse_header(header)?;

    let now = chrono::Utc::now().timestamp();
    if (now - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::TimestampOutOfRange);
    }

    let provided_bytes = hex::decode(provided).map_err(|_| SignatureError::MalformedHeader)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::MalformedHeader)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);

    mac.verify_slice(&provided_bytes)
        .map_err(|_| SignatureError::Mismatch)
}

/// Compute the header value for a payload. Used by tests and outbound mocks.
pub fn sign_payload(body: &[u8], timestamp: i64, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

fn parse_header(header: &str) -> Result<(i64, &str), SignatureError> {
    if header.trim().is_empty() {
        return Err(SignatureError::MissingHeader);
    }

    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(s)) if !s.is_empty() => Ok((t, s)),
        _ => Err(SignatureError::MalformedHeader),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"id":"evt_1","type":"checkout.session.completed","data":{}}"#;
        let header = sign_payload(body, chrono::Utc::now().timestamp(), SECRET);

        assert!(verify_signature(body, &header, SECRET, DEFAULT_TOLERANCE_SECS).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let body = br#"{"amount_total":2500}"#;
        let header = sign_payload(body, chrono::Utc::now().timestamp(), SECRET);

        let tampered = br#"{"amount_total":9999}"#;
        assert_eq!(
            verify_signature(tampered, &header, SECRET, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"payload";
        let header = sign_payload(body, chrono::Utc::now().timestamp(), SECRET);

        assert_eq!(
            verify_signature(body, &header, "whsec_other", DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_fails() {
        let body = b"payload";
        let old = chrono::Utc::now().timestamp() - 1000;
        let header = sign_payload(body, old, SECRET);

        assert_eq!(
            verify_signature(body, &header, SECRET, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::TimestampOutOfRange)
        );
    }

    #[test]
    fn malformed_headers_fail() {
        let body = b"payload";
        for header in ["", "t=abc,v1=00", "v1=00", "t=123", "garbage"] {
            let err = verify_signature(body, header, SECRET, DEFAULT_TOLERANCE_SECS).unwrap_err();
            assert!(
                matches!(
                    err,
                    SignatureError::MissingHeader | SignatureError::MalformedHeader
                ),
                "header {header:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn non_hex_signature_is_malformed() {
        let body = b"payload";
        let header = format!("t={},v1=zzzz", chrono::Utc::now().timestamp());
        assert_eq!(
            verify_signature(body, &header, SECRET, DEFAULT_TOLERANCE_SECS),
            Err(SignatureError::MalformedHeader)
        );
    }
}
