//! Lenient JSON extraction from chat model replies.
//!
//! Models wrap JSON in Markdown fences, prepend reasoning inside
//! `<think>` tags, or add a sentence of prose. These helpers peel that off.

use serde_json::Value;

/// Remove every `<think>...</think>` block. An unterminated block swallows
/// the rest of the text.
pub fn strip_think_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // skip the language tag line
    let body = match after_open.find('\n') {
        Some(newline) => &after_open[newline + 1..],
        None => after_open,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse the first JSON object or array found in a model reply.
pub fn extract_json_value(text: &str) -> Option<Value> {
    let cleaned = strip_think_blocks(text);
    let candidate = strip_code_fence(&cleaned);

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (candidate.find(open), candidate.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&candidate[start..=end]) {
                    return Some(value);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json() {
        let value = extract_json_value(r#"{"entities": ["A"]}"#).unwrap();
        assert_eq!(value["entities"][0], "A");
    }

    #[test]
    fn test_fenced_json() {
        let reply = "```json\n{\"entities\": [\"PYTHON\"]}\n```";
        let value = extract_json_value(reply).unwrap();
        assert_eq!(value["entities"][0], "PYTHON");
    }

    #[test]
    fn test_think_block_and_prose() {
        let reply = "<think>The user mentions {braces} here</think>\nSure! Here it is: {\"entities\": []} Hope that helps.";
        let value = extract_json_value(reply).unwrap();
        assert!(value["entities"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_unterminated_think_block() {
        assert_eq!(strip_think_blocks("answer<think>never closed"), "answer");
    }

    #[test]
    fn test_garbage_returns_none() {
        assert!(extract_json_value("I cannot help with that.").is_none());
        assert!(extract_json_value("").is_none());
        assert!(extract_json_value("{not json}").is_none());
    }

    #[test]
    fn test_scalar_is_not_accepted() {
        assert!(extract_json_value("42").is_none());
    }
}
