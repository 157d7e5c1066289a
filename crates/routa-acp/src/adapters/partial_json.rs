//! Incremental repair of partial JSON.
//!
//! Claude streams tool inputs as `input_json_delta` fragments; the UI
//! wants to preview the arguments while they are still being typed.
//! `repair_partial_json` closes whatever is open (strings, arrays,
//! objects), trims dangling separators, and parses the result.
//!
//! Refinement is monotonic: parsing a prefix and then parsing a longer
//! prefix never loses information, only adds or extends it.

use serde_json::Value;

/// Best-effort parse of an incomplete JSON fragment. Returns `None` when
/// the fragment has no parseable prefix yet (e.g. just `{"`).
pub fn repair_partial_json(partial: &str) -> Option<Value> {
    let trimmed = partial.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let repaired = close_open_tokens(trimmed)?;
    serde_json::from_str(&repaired).ok()
}

fn close_open_tokens(fragment: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in fragment.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        // Complete but unparseable: nothing we can do.
        return None;
    }

    let mut repaired = fragment.to_string();

    if in_string {
        if escaped {
            // A trailing lone backslash would escape our closing quote.
            repaired.pop();
        }
        repaired.push('"');
    }

    // `{"key":` needs a value; `{"a":1,` needs the separator gone.
    loop {
        match repaired.trim_end().chars().last() {
            Some(':') => {
                repaired = repaired.trim_end().to_string();
                repaired.push_str("null");
                break;
            }
            Some(',') => {
                repaired = repaired.trim_end().to_string();
                repaired.pop();
            }
            _ => break,
        }
    }

    for closer in stack.into_iter().rev() {
        repaired.push(closer);
    }
    Some(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn complete_json_is_identity() {
        let value = repair_partial_json(r#"{"file_path":"/a.rs","limit":10}"#).unwrap();
        assert_eq!(value, json!({ "file_path": "/a.rs", "limit": 10 }));
    }

    #[test]
    fn open_string_is_closed() {
        let value = repair_partial_json(r#"{"file_path":"/a."#).unwrap();
        assert_eq!(value["file_path"], "/a.");
    }

    #[test]
    fn dangling_key_becomes_null() {
        let value = repair_partial_json(r#"{"file_path":"/a.rs","limit":"#).unwrap();
        assert_eq!(value["file_path"], "/a.rs");
        assert!(value["limit"].is_null());
    }

    #[test]
    fn trailing_comma_is_trimmed() {
        let value = repair_partial_json(r#"{"a":1,"#).unwrap();
        assert_eq!(value, json!({ "a": 1 }));
    }

    #[test]
    fn nested_containers_close_in_order() {
        let value = repair_partial_json(r#"{"edits":[{"old_string":"x"#).unwrap();
        assert_eq!(value["edits"][0]["old_string"], "x");
    }

    #[test]
    fn escaped_quote_inside_open_string() {
        let value = repair_partial_json(r#"{"cmd":"echo \"hi"#).unwrap();
        assert_eq!(value["cmd"], "echo \"hi");
    }

    #[test]
    fn refinement_is_monotonic() {
        let full = r#"{"file_path":"/src/main.rs","offset":10,"limit":50}"#;
        let mut previous_keys = 0;
        for end in 1..=full.len() {
            let Some(value) = repair_partial_json(&full[..end]) else {
                continue;
            };
            let keys = value.as_object().map(|o| o.len()).unwrap_or(0);
            assert!(
                keys >= previous_keys,
                "lost keys at prefix length {end}: {value}"
            );
            previous_keys = keys;
        }
        assert_eq!(previous_keys, 3);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(repair_partial_json("").is_none());
        assert!(repair_partial_json("not json").is_none());
    }
}
