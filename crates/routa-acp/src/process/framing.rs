//! Line framing for agent stdout.
//!
//! Agents are supposed to emit one JSON object per line, but in practice
//! some concatenate objects without newlines and some prefix log noise.
//! `parse_json_objects` first tries the whole line, then falls back to a
//! string-aware balanced-brace scan that yields every embedded object in
//! order.

use serde_json::Value;

/// Parse every JSON object found in one stdout line, in order.
/// Returns an empty vec for non-JSON lines.
pub fn parse_json_objects(line: &str) -> Vec<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return vec![value];
        }
    }

    scan_embedded_objects(trimmed)
}

/// Scan for balanced `{...}` substrings, respecting JSON string literals
/// and escapes, and parse each.
fn scan_embedded_objects(line: &str) -> Vec<Value> {
    let mut found = Vec::new();
    let mut depth = 0i32;
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in line.char_indices() {
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
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            if let Ok(value) =
                                serde_json::from_str::<Value>(&line[s..=i])
                            {
                                found.push(value);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_object() {
        let parsed = parse_json_objects(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["id"], 1);
    }

    #[test]
    fn two_concatenated_objects_in_order() {
        let parsed = parse_json_objects(r#"{"id":1,"result":{}}{"method":"session/update"}"#);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["id"], 1);
        assert_eq!(parsed[1]["method"], "session/update");
    }

    #[test]
    fn braces_inside_strings_do_not_split() {
        let parsed = parse_json_objects(r#"log: {"text":"fn main() { }"}{"id":2}"#);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], json!({"text": "fn main() { }"}));
        assert_eq!(parsed[1], json!({"id": 2}));
    }

    #[test]
    fn escaped_quotes_inside_strings() {
        let parsed = parse_json_objects(r#"{"text":"say \"hi\" {ok}"}"#);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["text"], "say \"hi\" {ok}");
    }

    #[test]
    fn plain_text_yields_nothing() {
        assert!(parse_json_objects("npm WARN deprecated something").is_empty());
        assert!(parse_json_objects("").is_empty());
    }

    #[test]
    fn garbage_prefix_is_skipped() {
        let parsed = parse_json_objects(r#"[12:00:01] INFO {"method":"session/update","params":{}}"#);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["method"], "session/update");
    }
}
