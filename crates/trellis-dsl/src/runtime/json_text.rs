use serde_json::Value;

/// Parse the first balanced top-level JSON object or array embedded in `text`.
///
/// Brackets inside string literals are ignored. Returns `None` when no
/// balanced candidate exists or the candidate is not valid JSON.
pub fn extract_first_json(text: &str) -> Option<Value> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let mut stack: Vec<u8> = Vec::with_capacity(8);
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        if in_string {
            match c {
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            b'"' => in_string = true,
            b'{' | b'[' => stack.push(c),
            b'}' | b']' => {
                let open = stack.pop()?;
                if (open == b'{' && c != b'}') || (open == b'[' && c != b']') {
                    return None;
                }
                if stack.is_empty() {
                    return serde_json::from_str(&text[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn finds_object_in_prose() {
        let text = "Sure! Here you go: {\"label\": \"urgent\", \"note\": \"use {braces}\"} hope that helps";
        assert_eq!(extract_first_json(text), Some(json!({"label": "urgent", "note": "use {braces}"})));
    }

    #[test]
    fn finds_arrays_and_escapes() {
        assert_eq!(extract_first_json(r#"list: [1, "a\"]", 2] end"#), Some(json!([1, "a\"]", 2])));
    }

    #[test]
    fn rejects_unbalanced_or_invalid() {
        assert_eq!(extract_first_json("no json here"), None);
        assert_eq!(extract_first_json("{\"a\": [1}"), None);
        assert_eq!(extract_first_json("{\"a\": 1"), None);
        assert_eq!(extract_first_json("{not json}"), None);
    }
}
