//! Query string encoding for flight URLs.

use std::collections::HashMap;

use crate::error::FlightError;

/// Percent-encode a query component.
pub fn url_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len() * 3);
    for byte in s.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char)
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

/// Decode a percent-encoded query component (`+` is a space).
pub fn url_decode(s: &str) -> Result<String, FlightError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        FlightError::InvalidRequest(format!("bad percent escape in '{}'", s))
                    })?;
                out.push(hex);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out)
        .map_err(|_| FlightError::InvalidRequest(format!("query value '{}' is not UTF-8", s)))
}

/// Parse a query string into its parameters. The last occurrence wins.
pub fn parse_query(query: &str) -> Result<HashMap<String, String>, FlightError> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(url_decode(k)?, url_decode(v)?);
    }
    Ok(params)
}

/// Build a query string from parameters, in the given order.
pub fn build_query(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", url_encode(k), url_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
