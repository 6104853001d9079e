use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;

use crate::headers::{HEADER_WEBHOOK_SIGNATURE, HEADER_WEBHOOK_TIMESTAMP};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of generated subscription secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// Serialize a value as JSON with object keys in sorted order.
///
/// `serde_json::Value` keeps objects in a `BTreeMap`, so a round trip
/// through it yields a stable encoding regardless of struct field order.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// Sign a payload: canonical JSON, then HMAC-SHA256, as lowercase hex.
pub fn sign<T: Serialize + ?Sized>(payload: &T, secret: &str) -> Result<String, serde_json::Error> {
    let bytes = canonical_json(payload)?;
    Ok(compute_signature(secret, &bytes))
}

/// Compute the HMAC-SHA256 of raw bytes as lowercase hex.
pub fn compute_signature(secret: &str, payload: &[u8]) -> String {
    let mut mac = new_mac(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature over the exact bytes received.
///
/// The comparison is constant-time; malformed hex never matches.
pub fn verify_signature(raw_body: &[u8], signature_hex: &str, secret: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let mut mac = new_mac(secret);
    mac.update(raw_body);
    mac.verify_slice(&signature).is_ok()
}

fn new_mac(secret: &str) -> HmacSha256 {
    // HMAC accepts keys of any length.
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}

/// Generate a new subscription secret from the OS random source.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!("{SECRET_PREFIX}{}", hex::encode(bytes))
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp: DateTime<Utc>, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    now >= timestamp && now - timestamp <= max_age
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

/// Pick the signature and timestamp headers out of a header list, ignoring case.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedSignature::default();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(HEADER_WEBHOOK_SIGNATURE) {
            parsed.signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(HEADER_WEBHOOK_TIMESTAMP) {
            parsed.timestamp = Some(value.to_string());
        }
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("missing timestamp header")]
    MissingTimestamp,
    #[error("timestamp is not RFC 3339")]
    InvalidTimestamp,
    #[error("timestamp outside of the accepted window")]
    StaleTimestamp,
    #[error("signature mismatch")]
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
///
/// Intended for receivers of this engine's deliveries: checks that the
/// timestamp header is recent and that the signature matches the raw body.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    raw_body: &[u8],
    secret: &str,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp = parsed.timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|_| VerificationError::InvalidTimestamp)?
        .with_timezone(&Utc);

    if !is_timestamp_fresh(timestamp, now, max_age) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(raw_body, &signature, secret) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_sign_then_verify() {
        let payload = json!({"event": "ticket.created", "data": {"id": 7}});
        let signature = sign(&payload, SECRET).unwrap();
        let body = canonical_json(&payload).unwrap();

        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(verify_signature(&body, &signature, SECRET));
    }

    #[test]
    fn test_any_single_change_breaks_verification() {
        let body = br#"{"data":{"id":7},"event":"ticket.created"}"#.to_vec();
        let signature = compute_signature(SECRET, &body);

        let mut tampered_body = body.clone();
        tampered_body[3] ^= 0x01;
        assert!(!verify_signature(&tampered_body, &signature, SECRET));

        let mut tampered_sig = signature.clone().into_bytes();
        tampered_sig[0] = if tampered_sig[0] == b'a' { b'b' } else { b'a' };
        let tampered_sig = String::from_utf8(tampered_sig).unwrap();
        assert!(!verify_signature(&body, &tampered_sig, SECRET));

        assert!(!verify_signature(&body, &signature, "whsec_test_secres"));
    }

    #[test]
    fn test_malformed_signature_is_rejected() {
        assert!(!verify_signature(b"{}", "not-hex", SECRET));
        assert!(!verify_signature(b"{}", "", SECRET));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        #[derive(Serialize)]
        struct Unordered {
            zulu: u8,
            alpha: u8,
        }

        let bytes = canonical_json(&Unordered { zulu: 1, alpha: 2 }).unwrap();
        assert_eq!(bytes, br#"{"alpha":2,"zulu":1}"#);
    }

    #[test]
    fn test_generated_secrets_are_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.starts_with(SECRET_PREFIX));
        assert_eq!(a.len(), SECRET_PREFIX.len() + 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify_webhook_request() {
        let now = Utc::now();
        let body = br#"{"event":"x"}"#;
        let signature = compute_signature(SECRET, body);
        let timestamp = crate::types::format_timestamp(now);
        let headers = [
            ("x-webhook-signature", signature.as_str()),
            ("X-Webhook-Timestamp", timestamp.as_str()),
        ];

        let max_age = chrono::Duration::minutes(5);
        assert_eq!(verify_webhook_request(headers, body, SECRET, max_age, now), Ok(()));
        assert_eq!(
            verify_webhook_request(headers, body, SECRET, max_age, now + chrono::Duration::minutes(10)),
            Err(VerificationError::StaleTimestamp)
        );
        assert_eq!(
            verify_webhook_request(headers, b"{}", SECRET, max_age, now),
            Err(VerificationError::InvalidSignature)
        );
        assert_eq!(
            verify_webhook_request([("X-Webhook-Timestamp", timestamp.as_str())], body, SECRET, max_age, now),
            Err(VerificationError::MissingSignature)
        );
    }
}
