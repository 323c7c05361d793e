//! Deterministic cache key construction
//!
//! Keys hash the salient inputs of a request: identical requests always map
//! to the same key. `serde_json` maps are sorted, so serialization order is
//! stable regardless of how the inputs were assembled.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Cache key for a language-model request: model, message list, tool
/// schema, and temperature are salient
#[must_use]
pub fn llm_cache_key(
    model: &str,
    messages: &[Value],
    tools: Option<&Value>,
    temperature: f32,
) -> String {
    let salient = json!({
        "model": model,
        "messages": messages,
        "tools": tools.cloned().unwrap_or_else(|| json!([])),
        "temperature": format!("{temperature:.3}"),
    });
    format!("llm_{model}_{}", stable_hash(&salient))
}

/// Cache key for extracted content: URL and extraction method are salient
#[must_use]
pub fn content_cache_key(url: &str, method: &str) -> String {
    let salient = json!({ "url": url, "method": method });
    format!("content_{}", stable_hash(&salient))
}

fn stable_hash(value: &Value) -> String {
    let canonical = value.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_llm_requests_share_a_key() {
        let messages = vec![json!({"role": "user", "content": "list acts"})];
        let a = llm_cache_key("gpt-4", &messages, None, 0.1);
        let b = llm_cache_key("gpt-4", &messages, None, 0.1);
        assert_eq!(a, b);
        assert!(a.starts_with("llm_gpt-4_"));
    }

    #[test]
    fn salient_input_changes_change_the_key() {
        let messages = vec![json!({"role": "user", "content": "list acts"})];
        let base = llm_cache_key("gpt-4", &messages, None, 0.1);
        assert_ne!(base, llm_cache_key("gpt-4o", &messages, None, 0.1));
        assert_ne!(base, llm_cache_key("gpt-4", &messages, None, 0.7));
        assert_ne!(
            base,
            llm_cache_key("gpt-4", &messages, Some(&json!([{"name": "t"}])), 0.1)
        );
    }

    #[test]
    fn content_keys_depend_on_url_and_method() {
        let a = content_cache_key("https://example.gov/acts", "adaptive");
        let b = content_cache_key("https://example.gov/acts", "static");
        assert_ne!(a, b);
        assert!(a.starts_with("content_"));
    }
}
