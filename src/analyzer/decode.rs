//! Structured-response decoder
//!
//! Model responses arrive wrapped in prose or markdown fences. Every caller
//! goes through these helpers so the fallback policy lives in one place.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::DecodeError;

/// Keys a JSON-mode response may use to wrap the per-item list
const LIST_KEYS: [&str; 4] = ["results", "items", "outcomes", "data"];

/// Return the body of the first markdown code fence, if any
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an optional language tag on the fence line
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn delimited(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Extract a JSON object from a response that may contain fences or prose
pub fn extract_json_object(text: &str) -> Result<&str, DecodeError> {
    if text.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    if let Some(block) = fenced_block(text) {
        if block.starts_with('{') {
            return Ok(block);
        }
    }
    delimited(text, '{', '}').ok_or(DecodeError::NotFound("object"))
}

/// Extract a JSON array from a response that may contain fences or prose
pub fn extract_json_array(text: &str) -> Result<&str, DecodeError> {
    if text.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    if let Some(block) = fenced_block(text) {
        if block.starts_with('[') {
            return Ok(block);
        }
    }
    delimited(text, '[', ']').ok_or(DecodeError::NotFound("array"))
}

/// Decode a single JSON object into `T`
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, DecodeError> {
    let raw = extract_json_object(text)?;
    Ok(serde_json::from_str(raw)?)
}

/// Decode a per-item list.
///
/// Accepts a bare array, or an object wrapping the array under a common key
/// (what JSON-mode endpoints return).
pub fn decode_list(text: &str) -> Result<Vec<Value>, DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    // Whole response is JSON: check for a wrapped list first
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(list) = unwrap_list(value) {
            return Ok(list);
        }
    }

    if let Some(block) = fenced_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            if let Some(list) = unwrap_list(value) {
                return Ok(list);
            }
        }
    }

    let raw = extract_json_array(text)?;
    Ok(serde_json::from_str(raw)?)
}

fn unwrap_list(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            for key in LIST_KEYS {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return Some(items);
                }
            }
            // Single-key wrapper with an unexpected name
            if map.len() == 1 {
                if let Some((_, Value::Array(items))) = map.into_iter().next() {
                    return Some(items);
                }
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_extract_json_object_from_code_block() {
        let text =
            "Here's the result:\n```json\n{\"key\": \"value\", \"number\": 42}\n```\nThat's it.";
        let result = extract_json_object(text).unwrap();
        assert_eq!(result, r#"{"key": "value", "number": 42}"#);
    }

    #[test]
    fn test_extract_json_object_raw() {
        let text = r#"Result: {"name": "test"} done"#;
        assert_eq!(extract_json_object(text).unwrap(), r#"{"name": "test"}"#);
    }

    #[test]
    fn test_extract_json_array_plain_fence() {
        let text = "Results:\n```\n[{\"id\": 1}, {\"id\": 2}]\n```\nEnd.";
        let result = extract_json_array(text).unwrap();
        assert!(result.starts_with('['));
        assert!(result.ends_with(']'));
    }

    #[test]
    fn test_missing_and_empty() {
        assert!(matches!(extract_json_array("no json here"), Err(DecodeError::NotFound("array"))));
        assert!(matches!(extract_json_object("   "), Err(DecodeError::Empty)));
    }

    #[test]
    fn test_decode_json_typed() {
        #[derive(Deserialize)]
        struct Verdict {
            status: String,
        }
        let v: Verdict = decode_json("```json\n{\"status\": \"compliant\"}\n```").unwrap();
        assert_eq!(v.status, "compliant");
        assert!(matches!(
            decode_json::<Verdict>("{\"status\": }"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_list_shapes() {
        let bare = decode_list(r#"[{"index": 1}]"#).unwrap();
        assert_eq!(bare, vec![json!({"index": 1})]);

        let wrapped = decode_list(r#"{"results": [{"index": 1}, {"index": 2}]}"#).unwrap();
        assert_eq!(wrapped.len(), 2);

        let odd_key = decode_list(r#"{"checks": [{"index": 3}]}"#).unwrap();
        assert_eq!(odd_key, vec![json!({"index": 3})]);

        let fenced = decode_list("Sure!\n```json\n{\"items\": [{\"index\": 1}]}\n```").unwrap();
        assert_eq!(fenced.len(), 1);

        let prose = decode_list("The answer is [{\"index\": 1}] as requested").unwrap();
        assert_eq!(prose.len(), 1);
    }
}
