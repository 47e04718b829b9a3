//! Shared utility functions used across the codebase.

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// any other value maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Truncate `text` to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Deduplicate and trim a list of names, preserving order.
pub fn dedup_trimmed<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for name in names {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Remove a surrounding markdown code fence (```` ```json ```` or bare ```` ``` ````).
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Slice out the outermost JSON object: first `{` through last `}`.
///
/// When the closing brace is missing (truncated output) the slice runs to the
/// end of the text so [`repair_json`] can close it.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    match text.rfind('}') {
        Some(end) if end > start => Some(&text[start..=end]),
        _ => Some(&text[start..]),
    }
}

/// Best-effort repair of model-produced JSON.
///
/// Handles trailing commas, an unterminated final string, a dangling key
/// without a value, and unbalanced braces or brackets. String contents are
/// never rewritten.
pub fn repair_json(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                trim_trailing_comma(&mut out);
                if closers.last() == Some(&c) {
                    closers.pop();
                    out.push(c);
                }
                // Stray closers are dropped.
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    if !closers.is_empty() {
        trim_dangling_member(&mut out, closers.last() == Some(&'}'));
    }
    while let Some(closer) = closers.pop() {
        trim_trailing_comma(&mut out);
        out.push(closer);
    }
    out
}

/// Strip fences, extract the object, and parse it, repairing once on failure.
pub fn parse_json_lenient(text: &str) -> Result<serde_json::Value, serde_json::Error> {
    let cleaned = strip_code_fences(text);
    let candidate = extract_json_object(cleaned).unwrap_or(cleaned);
    match serde_json::from_str(candidate) {
        Ok(value) => Ok(value),
        Err(first) => {
            let repaired = repair_json(candidate);
            tracing::debug!("JSON parse failed ({}), retrying after repair", first);
            serde_json::from_str(&repaired)
        }
    }
}

fn trim_trailing_comma(out: &mut String) {
    let len = out.trim_end().len();
    out.truncate(len);
    if out.ends_with(',') {
        out.pop();
    }
}

/// Drop an incomplete trailing `"key":` or bare `"key"` inside an object.
fn trim_dangling_member(out: &mut String, in_object: bool) {
    let len = out.trim_end().len();
    out.truncate(len);

    let dangling_colon = out.ends_with(':');
    if dangling_colon {
        out.pop();
        let len = out.trim_end().len();
        out.truncate(len);
    }
    if !(dangling_colon || in_object) || !out.ends_with('"') {
        return;
    }
    let Some(start) = last_string_start(out) else {
        return;
    };
    let before = out[..start].trim_end();
    if dangling_colon || before.ends_with(',') || before.ends_with('{') {
        out.truncate(start);
        trim_trailing_comma(out);
    }
}

/// Byte index of the opening quote of the string literal that ends `out`.
fn last_string_start(out: &str) -> Option<usize> {
    let bytes = out.as_bytes();
    let mut idx = bytes.len().checked_sub(1)?;
    while idx > 0 {
        idx -= 1;
        if bytes[idx] == b'"' {
            let backslashes = bytes[..idx].iter().rev().take_while(|b| **b == b'\\').count();
            if backslashes % 2 == 0 {
                return Some(idx);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn dedup_trimmed_deduplicates_and_trims() {
        let names = vec![" gmail ", "slack", "gmail", "", "  ", "slack"];
        assert_eq!(dedup_trimmed(names), vec!["gmail", "slack"]);
    }

    #[test]
    fn strip_code_fences_handles_json_fence() {
        let text = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(text), "{\"a\": 1}");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n[1]\n```"), "[1]");
    }

    #[test]
    fn extract_json_object_skips_prose() {
        let text = "Here is the plan: {\"ready\": true} hope it helps";
        assert_eq!(extract_json_object(text), Some("{\"ready\": true}"));
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn repair_json_removes_trailing_commas() {
        let fixed = repair_json("{\"a\": [1, 2,], \"b\": 3,}");
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["a"], serde_json::json!([1, 2]));
        assert_eq!(value["b"], 3);
    }

    #[test]
    fn repair_json_closes_truncated_document() {
        let fixed = repair_json("{\"nodes\": [{\"name\": \"Webhook\", \"type\": \"n8n-nodes-base.webh");
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["nodes"][0]["name"], "Webhook");
    }

    #[test]
    fn repair_json_drops_dangling_key() {
        let fixed = repair_json("{\"a\": 1, \"b\":");
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));

        let fixed = repair_json("{\"a\": 1, \"b\"");
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value, serde_json::json!({"a": 1}));
    }

    #[test]
    fn repair_json_leaves_string_contents_alone() {
        let fixed = repair_json("{\"code\": \"if (x) { return [1,]; }\",}");
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["code"], "if (x) { return [1,]; }");
    }

    #[test]
    fn parse_json_lenient_handles_fenced_broken_output() {
        let text = "```json\n{\"approved\": true, \"feedback\": \"ok\",}\n```";
        let value = parse_json_lenient(text).unwrap();
        assert_eq!(value["approved"], true);
    }
}
