//! Lenient parsing of incomplete JSON text.
//!
//! Streaming vendors deliver tool-call arguments and JSON-mode output as
//! arbitrary fragments. [`parse_partial`] turns any prefix of a JSON document
//! into the largest value that prefix already commits to: open strings and
//! containers are closed, while a half-written key or literal is dropped.

use serde_json::Value;

/// Best-effort parse of a JSON prefix. Never fails; returns `None` when the
/// prefix does not yet contain any value.
pub fn parse_partial(input: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(input) {
        return Some(v);
    }
    let candidate = complete_prefix(input)?;
    serde_json::from_str(&candidate).ok()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Container {
    Object { awaiting_key: bool },
    Array,
}

fn closers(stack: &[Container]) -> String {
    stack
        .iter()
        .rev()
        .map(|c| match c {
            Container::Object { .. } => '}',
            Container::Array => ']',
        })
        .collect()
}

fn is_complete_scalar(token: &str) -> bool {
    match token {
        "true" | "false" | "null" => true,
        _ => {
            !token.ends_with(['.', '-', '+', 'e', 'E'])
                && serde_json::from_str::<serde_json::Number>(token).is_ok()
        }
    }
}

/// Rewrite `input` so it parses: cut back to the last point where a value was
/// complete (or into an open value string) and close every open container.
fn complete_prefix(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut stack: Vec<Container> = Vec::new();
    // Byte offset where the prefix is complete, with the containers still
    // open at that point.
    let mut safe: Option<(usize, Vec<Container>)> = None;

    let mut in_string = false;
    let mut string_is_key = false;
    let mut escape = false;
    // Start of a pending `\` or `\uXXXX` escape inside the current string.
    let mut escape_start = 0;
    let mut unicode_left = 0u8;

    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if unicode_left > 0 {
                unicode_left = if b.is_ascii_hexdigit() { unicode_left - 1 } else { 0 };
            } else if escape {
                escape = false;
                if b == b'u' {
                    unicode_left = 4;
                }
            } else if b == b'\\' {
                escape = true;
                escape_start = i;
            } else if b == b'"' {
                in_string = false;
                if !string_is_key {
                    safe = Some((i + 1, stack.clone()));
                }
            }
            i += 1;
            continue;
        }

        match b {
            b'"' => {
                in_string = true;
                string_is_key = matches!(
                    stack.last(),
                    Some(Container::Object { awaiting_key: true })
                );
            }
            b'{' => {
                stack.push(Container::Object { awaiting_key: true });
                safe = Some((i + 1, stack.clone()));
            }
            b'[' => {
                stack.push(Container::Array);
                safe = Some((i + 1, stack.clone()));
            }
            b'}' | b']' => {
                stack.pop();
                safe = Some((i + 1, stack.clone()));
            }
            b':' => {
                if let Some(Container::Object { awaiting_key }) = stack.last_mut() {
                    *awaiting_key = false;
                }
            }
            b',' => {
                if let Some(Container::Object { awaiting_key }) = stack.last_mut() {
                    *awaiting_key = true;
                }
            }
            b if b.is_ascii_whitespace() => {}
            _ => {
                let start = i;
                while i < bytes.len()
                    && !matches!(bytes[i], b',' | b'}' | b']' | b':')
                    && !bytes[i].is_ascii_whitespace()
                {
                    i += 1;
                }
                let token = &input[start..i];
                if i < bytes.len() || is_complete_scalar(token) {
                    safe = Some((i, stack.clone()));
                }
                continue;
            }
        }
        i += 1;
    }

    if in_string && !string_is_key {
        let mut end = bytes.len();
        if escape || unicode_left > 0 {
            end = escape_start;
        }
        let mut out = input[..end].to_string();
        out.push('"');
        out.push_str(&closers(&stack));
        return Some(out);
    }

    let (cut, open) = safe?;
    let mut out = input[..cut].trim_end().to_string();
    out.push_str(&closers(&open));
    Some(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
