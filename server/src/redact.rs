//! Central log redaction.
//!
//! Identifiers never appear verbatim in logs; they pass through [`for_log`]
//! which yields a short non-reversible hash tag. Bearer tokens shrink to
//! `***<sha256-first-8>`. JSON payloads headed for a log line go through
//! [`scrub_json`], which blanks the deny-listed fields.

use sha2::{Digest, Sha256};

/// Fields that must never reach a log line with their value intact.
const DENY_LIST: &[&str] = &[
    "refresh_token",
    "recovery_code",
    "pairing_token",
    "authorization",
    "Authorization",
    "encryptedContent",
    "encrypted_content",
];

const REDACTED: &str = "[Redacted]";

/// 8-byte truncated SHA256, hex encoded.
pub fn hash8(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Redact an identifier for logs with a short, non-reversible tag.
/// Example: "h:3fae91b2c4d5e677"
pub fn for_log(value: &str) -> String {
    format!("h:{}", hash8(value))
}

/// Shorten a token to `***<sha256-first-8>`.
pub fn token(value: &str) -> String {
    format!("***{}", hash8(value))
}

/// Replace deny-listed fields in a JSON value, recursively.
pub fn scrub_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if DENY_LIST.contains(&key.as_str()) {
                    *entry = serde_json::Value::String(REDACTED.to_string());
                } else {
                    scrub_json(entry);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                scrub_json(item);
            }
        }
        _ => {}
    }
}

/// Render an error chain for logging with bearer-token shaped substrings
/// shortened. Context strings occasionally embed whole headers.
pub fn error_chain(err: &anyhow::Error) -> String {
    let rendered = format!("{err:#}");
    redact_bearer(&rendered)
}

fn redact_bearer(text: &str) -> String {
    match text.find("Bearer ") {
        Some(idx) => {
            let start = idx + "Bearer ".len();
            let end = text[start..]
                .find(|c: char| c.is_whitespace() || c == '"')
                .map(|off| start + off)
                .unwrap_or(text.len());
            if end > start {
                let mut out = String::with_capacity(text.len());
                out.push_str(&text[..start]);
                out.push_str(&token(&text[start..end]));
                out.push_str(&text[end..]);
                out
            } else {
                text.to_string()
            }
        }
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash8_is_stable_and_short() {
        let a = hash8("conversation-1");
        let b = hash8("conversation-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn token_shortening() {
        let short = token("eyJhbGciOiJSUzI1NiJ9.payload.sig");
        assert!(short.starts_with("***"));
        assert_eq!(short.len(), 3 + 16);
        assert!(!short.contains("payload"));
    }

    #[test]
    fn scrub_removes_deny_listed_fields() {
        let mut body = json!({
            "conversationId": "c1",
            "encryptedContent": "U0VDUkVU",
            "nested": {
                "refresh_token": "rt-123",
                "list": [{"pairing_token": "pt-9"}]
            }
        });
        scrub_json(&mut body);
        assert_eq!(body["encryptedContent"], "[Redacted]");
        assert_eq!(body["nested"]["refresh_token"], "[Redacted]");
        assert_eq!(body["nested"]["list"][0]["pairing_token"], "[Redacted]");
        assert_eq!(body["conversationId"], "c1");
    }

    #[test]
    fn bearer_tokens_are_shortened_in_error_chains() {
        let err = anyhow::anyhow!("upstream rejected Authorization: Bearer abc.def.ghi");
        let rendered = error_chain(&err);
        assert!(!rendered.contains("abc.def.ghi"));
        assert!(rendered.contains("***"));
    }
}
