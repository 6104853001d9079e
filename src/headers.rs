use std::collections::BTreeMap;

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_USER_AGENT: &str = "User-Agent";
pub const HEADER_WEBHOOK_EVENT: &str = "X-Webhook-Event";
pub const HEADER_WEBHOOK_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_WEBHOOK_SIGNATURE: &str = "X-Webhook-Signature";

pub const CONTENT_TYPE_JSON: &str = "application/json";

pub const DEFAULT_USER_AGENT: &str = concat!("webhook-engine/", env!("CARGO_PKG_VERSION"));

/// Build the outgoing header set of a delivery.
///
/// Defaults come first; `custom` headers are merged last and replace a
/// default of the same name regardless of case.
pub fn build_delivery_headers(
    user_agent: &str,
    event: &str,
    timestamp: &str,
    signature: &str,
    custom: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(HEADER_CONTENT_TYPE.to_string(), CONTENT_TYPE_JSON.to_string());
    headers.insert(HEADER_USER_AGENT.to_string(), user_agent.to_string());
    headers.insert(HEADER_WEBHOOK_EVENT.to_string(), event.to_string());
    headers.insert(HEADER_WEBHOOK_TIMESTAMP.to_string(), timestamp.to_string());
    headers.insert(HEADER_WEBHOOK_SIGNATURE.to_string(), signature.to_string());

    for (name, value) in custom {
        set_header(&mut headers, name, value);
    }

    headers
}

/// Insert or replace a header, matching existing names case-insensitively.
pub fn set_header(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
    headers.insert(name.to_string(), value.to_string());
}

/// Case-insensitive header lookup.
pub fn get_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Convert a reqwest header map into the stored form.
pub(crate) fn headers_to_map(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_present() {
        let headers = build_delivery_headers("ua/1", "ticket.created", "ts", "sig", &BTreeMap::new());
        assert_eq!(get_header(&headers, "content-type"), Some(CONTENT_TYPE_JSON));
        assert_eq!(get_header(&headers, "user-agent"), Some("ua/1"));
        assert_eq!(get_header(&headers, HEADER_WEBHOOK_EVENT), Some("ticket.created"));
        assert_eq!(get_header(&headers, HEADER_WEBHOOK_TIMESTAMP), Some("ts"));
        assert_eq!(get_header(&headers, HEADER_WEBHOOK_SIGNATURE), Some("sig"));
    }

    #[test]
    fn test_custom_headers_override_defaults() {
        let mut custom = BTreeMap::new();
        custom.insert("user-agent".to_string(), "custom-agent".to_string());
        custom.insert("X-Tenant".to_string(), "acme".to_string());

        let headers = build_delivery_headers("ua/1", "e", "ts", "sig", &custom);
        assert_eq!(get_header(&headers, HEADER_USER_AGENT), Some("custom-agent"));
        assert_eq!(get_header(&headers, "x-tenant"), Some("acme"));
        assert_eq!(
            headers.keys().filter(|k| k.eq_ignore_ascii_case("user-agent")).count(),
            1
        );
    }
}
