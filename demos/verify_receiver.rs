use chrono::{Duration, Utc};
use webhook_engine::{
    compute_signature, format_timestamp, verify_webhook_request, HEADER_WEBHOOK_SIGNATURE,
    HEADER_WEBHOOK_TIMESTAMP,
};

fn main() {
    let secret = "whsec_supersecret";
    let body = br#"{"data":{"id":123},"event":"order.created","metadata":null,"timestamp":"2024-01-01T00:00:00.000Z"}"#;

    // What the engine would send along with `body`.
    let signature = compute_signature(secret, body);
    let timestamp = format_timestamp(Utc::now());
    let headers = [
        (HEADER_WEBHOOK_SIGNATURE, signature.as_str()),
        (HEADER_WEBHOOK_TIMESTAMP, timestamp.as_str()),
    ];

    match verify_webhook_request(headers, body, secret, Duration::minutes(5), Utc::now()) {
        Ok(()) => println!("signature verified"),
        Err(e) => println!("rejected: {e}"),
    }

    let tampered = br#"{"data":{"id":124},"event":"order.created","metadata":null,"timestamp":"2024-01-01T00:00:00.000Z"}"#;
    match verify_webhook_request(headers, tampered, secret, Duration::minutes(5), Utc::now()) {
        Ok(()) => println!("signature verified"),
        Err(e) => println!("rejected: {e}"),
    }
}
