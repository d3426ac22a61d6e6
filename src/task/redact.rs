//! Strip embedded binary payloads from provider responses before persisting.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde_json::Value;

/// Characters of an embedded payload kept after truncation.
pub const MAX_EMBEDDED_CHARS: usize = 256;

const BINARY_KEYS: &[&str] = &["bytesBase64Encoded"];

/// Redact a raw provider body. Non-JSON bodies are returned unchanged.
pub fn redact_payload(body: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    redact_value(&mut value);
    serde_json::to_string(&value).unwrap_or_else(|_| body.to_string())
}

fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in BINARY_KEYS {
                map.remove(*key);
            }
            for v in map.values_mut() {
                redact_value(v);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        Value::String(s) => {
            if looks_embedded(s) {
                *s = truncate(s);
            }
        }
        _ => {}
    }
}

fn looks_embedded(s: &str) -> bool {
    if s.len() <= MAX_EMBEDDED_CHARS {
        return false;
    }
    if s.starts_with("data:") {
        return true;
    }
    // Decode an aligned prefix only; a whole video is not worth decoding.
    let prefix = &s.as_bytes()[..MAX_EMBEDDED_CHARS];
    STANDARD.decode(prefix).is_ok() || URL_SAFE.decode(prefix).is_ok()
}

fn truncate(s: &str) -> String {
    let mut end = MAX_EMBEDDED_CHARS;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removes_binary_keys_anywhere() {
        let body = r#"{"response":{"bytesBase64Encoded":"AAAA","videos":[{"bytesBase64Encoded":"BBBB","uri":"u"}]}}"#;
        let out: Value = serde_json::from_str(&redact_payload(body)).unwrap();
        assert!(out["response"].get("bytesBase64Encoded").is_none());
        assert!(out["response"]["videos"][0].get("bytesBase64Encoded").is_none());
        assert_eq!(out["response"]["videos"][0]["uri"], "u");
    }

    #[test]
    fn test_truncates_long_base64() {
        let blob = "A".repeat(1000);
        let body = serde_json::json!({"response": {"video": blob}}).to_string();
        let out: Value = serde_json::from_str(&redact_payload(&body)).unwrap();
        let video = out["response"]["video"].as_str().unwrap();
        assert_eq!(video.len(), MAX_EMBEDDED_CHARS + 3);
        assert!(video.ends_with("..."));
    }

    #[test]
    fn test_keeps_urls_and_short_strings() {
        let url = format!("https://cdn.example.com/{}.mp4?sig={}", "v", "x".repeat(300));
        let body = serde_json::json!({"url": url, "status": "done"}).to_string();
        let out: Value = serde_json::from_str(&redact_payload(&body)).unwrap();
        assert_eq!(out["url"], url);
        assert_eq!(out["status"], "done");
    }

    #[test]
    fn test_non_json_unchanged() {
        assert_eq!(redact_payload("upstream exploded"), "upstream exploded");
    }
}
