//! Lenient parsing for LLM output.
//!
//! Providers truncate long responses mid-token, wrap JSON in markdown fences,
//! or prepend prose. This module recovers a usable value from all of those
//! shapes: extract the JSON span, then repair truncation by closing open
//! strings and containers, trimming incomplete trailing tokens one at a time
//! until the document parses. When even repair fails, named top-level
//! sections can still be pulled out individually.

use serde_json::Value;

/// Best-effort parse: direct, then extracted, then repaired.
pub fn parse_lenient(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let span = extract_json(trimmed)?;
    if let Ok(value) = serde_json::from_str(span) {
        return Some(value);
    }
    repair_truncated(span)
}

/// Locate the JSON payload inside a raw response: fenced block first, then
/// the first `{` or `[` onward. The span may itself be truncated.
pub fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();

    if let Some(fenced) = extract_fenced(trimmed) {
        return Some(fenced);
    }

    let start = trimmed.find(['{', '['])?;
    let body = &trimmed[start..];
    match balanced_end(body) {
        Some(end) => Some(&body[..end]),
        None => Some(body),
    }
}

fn extract_fenced(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after = &raw[open + 3..];
    // skip an optional language tag on the fence line
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let close = body.find("```").unwrap_or(body.len());
    let inner = body[..close].trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner)
    }
}

/// Byte offset one past the point where the document's outermost container
/// closes, or `None` if it never does.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Repair a truncated JSON document.
///
/// Each pass balances the current prefix (close the open string if any,
/// append the missing closers) and tries to parse. On failure the trailing
/// token is dropped and the pass repeats; the prefix shrinks monotonically so
/// the loop terminates.
pub fn repair_truncated(input: &str) -> Option<Value> {
    let mut work = input.trim_end().to_string();

    while !work.is_empty() {
        if let Some(value) = balance_and_parse(&work) {
            return Some(value);
        }
        match last_token_start(&work) {
            Some(start) if start < work.len() => {
                work.truncate(start);
                let trimmed = work.trim_end().len();
                work.truncate(trimmed);
            }
            _ => return None,
        }
    }
    None
}

fn balance_and_parse(s: &str) -> Option<Value> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for c in s.chars() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut candidate = s.to_string();
    if in_string {
        if escape {
            candidate.pop();
        }
        candidate.push('"');
    }
    while let Some(closer) = stack.pop() {
        candidate.push(closer);
    }
    serde_json::from_str(&candidate).ok()
}

/// Byte offset where the final lexical token begins. Strings, numbers, and
/// literals count as one token; structural characters count individually.
fn last_token_start(s: &str) -> Option<usize> {
    let mut last: Option<usize> = None;
    let mut in_string = false;
    let mut in_scalar = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                in_scalar = false;
                last = Some(i);
            }
            '{' | '}' | '[' | ']' | ',' | ':' => {
                in_scalar = false;
                last = Some(i);
            }
            c if c.is_whitespace() => {
                in_scalar = false;
            }
            _ => {
                // number or literal continuation
                if !in_scalar {
                    in_scalar = true;
                    last = Some(i);
                }
            }
        }
    }
    last
}

/// Pull one named top-level section out of an otherwise unusable response.
/// The section value itself is repaired if truncated.
pub fn extract_section(raw: &str, key: &str) -> Option<Value> {
    let needle = format!("\"{}\"", key);
    let key_pos = raw.find(&needle)?;
    let after_key = &raw[key_pos + needle.len()..];
    let colon = after_key.find(':')?;
    let value_str = after_key[colon + 1..].trim_start();

    match value_str.chars().next()? {
        '{' | '[' => {
            let span = match balanced_end(value_str) {
                Some(end) => &value_str[..end],
                None => value_str,
            };
            serde_json::from_str(span).ok().or_else(|| repair_truncated(span))
        }
        '"' => {
            let span = match string_end(value_str) {
                Some(end) => &value_str[..end],
                None => value_str,
            };
            serde_json::from_str(span)
                .ok()
                .or_else(|| repair_truncated(span))
        }
        _ => {
            // bare scalar: take until the next structural delimiter
            let end = value_str
                .find([',', '}', ']', '\n'])
                .unwrap_or(value_str.len());
            serde_json::from_str(value_str[..end].trim()).ok()
        }
    }
}

fn string_end(s: &str) -> Option<usize> {
    let mut escape = false;
    for (i, c) in s.char_indices().skip(1) {
        if escape {
            escape = false;
        } else if c == '\\' {
            escape = true;
        } else if c == '"' {
            return Some(i + 1);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn passes_valid_json_through() {
        let value = parse_lenient(r#"{"scores":{"rapport":80}}"#).unwrap();
        assert_eq!(value["scores"]["rapport"], 80);
    }

    #[test]
    fn strips_markdown_fences() {
        let raw = "```json\n{\"summary\": \"Solid close\"}\n```";
        let value = parse_lenient(raw).unwrap();
        assert_eq!(value["summary"], "Solid close");
    }

    #[test]
    fn skips_leading_prose() {
        let raw = "Here is the grading result:\n{\"summary\": \"ok\"} Hope that helps!";
        let value = parse_lenient(raw).unwrap();
        assert_eq!(value["summary"], "ok");
    }

    #[test]
    fn repairs_truncation_mid_number() {
        // Truncated after "discovery":7 — earlier complete fields must survive
        let raw = r#"{"scores":{"rapport":80,"discovery":7"#;
        let value = parse_lenient(raw).unwrap();
        assert_eq!(value["scores"]["rapport"], 80);
    }

    #[test]
    fn repairs_truncation_mid_string() {
        let raw = r#"{"summary":"Great rapport bu"#;
        let value = parse_lenient(raw).unwrap();
        assert!(value["summary"].as_str().unwrap().starts_with("Great rapport"));
    }

    #[test]
    fn repairs_dangling_key() {
        let raw = r#"{"scores":{"rapport":80},"feedba"#;
        let value = parse_lenient(raw).unwrap();
        assert_eq!(value["scores"]["rapport"], 80);
        assert!(value.get("feedba").is_none() || value["feedba"].is_null());
    }

    #[test]
    fn repairs_dangling_colon() {
        let raw = r#"{"scores":{"rapport":80},"summary":"#;
        let value = parse_lenient(raw).unwrap();
        assert_eq!(value["scores"]["rapport"], 80);
    }

    #[test]
    fn repairs_incomplete_literal() {
        let raw = r#"{"scores":{"rapport":80},"partial":tru"#;
        let value = parse_lenient(raw).unwrap();
        assert_eq!(value["scores"]["rapport"], 80);
    }

    #[test]
    fn repairs_truncated_array() {
        let raw = r#"{"strengths":["clear opener","good pace"#;
        let value = parse_lenient(raw).unwrap();
        let strengths = value["strengths"].as_array().unwrap();
        assert_eq!(strengths[0], "clear opener");
    }

    #[test]
    fn every_truncation_offset_yields_some_document() {
        let full = r#"{"scores":{"rapport":80,"discovery":75},"summary":"Good pace, weak close","feedback":{"strengths":["opener"],"improvements":["ask twice"]},"partial":false}"#;
        for end in 1..=full.len() {
            let prefix = &full[..end];
            assert!(
                parse_lenient(prefix).is_some(),
                "no recovery at offset {end}: {prefix}"
            );
        }
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_lenient("I could not grade this session.").is_none());
        assert!(parse_lenient("").is_none());
    }

    #[test]
    fn extracts_section_from_broken_document() {
        // Document is hopeless as a whole but scores is intact
        let raw = r#"grade: "scores": {"rapport": 70, "discovery": 60}, then garbage }}]"#;
        let scores = extract_section(raw, "scores").unwrap();
        assert_eq!(scores, json!({"rapport": 70, "discovery": 60}));
    }

    #[test]
    fn extracts_truncated_string_section() {
        let raw = r#""summary": "Strong discovery but weak clo"#;
        let summary = extract_section(raw, "summary").unwrap();
        assert!(summary.as_str().unwrap().starts_with("Strong discovery"));
    }

    #[test]
    fn section_extraction_misses_cleanly() {
        assert!(extract_section("no json here", "scores").is_none());
    }
}
