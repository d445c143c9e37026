use std::borrow::Cow;

const TOKEN_JSON_FIELDS: [&str; 2] = ["\"accessToken\"", "\"refreshToken\""];

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let nee = needle.as_bytes();
    if nee.is_empty() {
        return Some(0);
    }
    if nee.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - nee.len()).find(|&i| hay[i..i + nee.len()].eq_ignore_ascii_case(nee))
}

/// Replaces every value following `marker` up to the first byte matching `stop`.
fn redact_after(text: &str, marker: &str, stop: impl Fn(char) -> bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = find_ascii_case_insensitive(rest, marker) {
        let value_start = idx + marker.len();
        out.push_str(&rest[..value_start]);
        rest = &rest[value_start..];

        let consumed: usize = rest
            .chars()
            .take_while(|ch| !stop(*ch))
            .map(char::len_utf8)
            .sum();
        if consumed > 0 {
            out.push_str("REDACTED");
        }
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    out
}

fn redact_json_string_field(text: &str, field: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find(field) {
        let after_field = idx + field.len();
        out.push_str(&rest[..after_field]);
        rest = &rest[after_field..];

        // Expect `: "value"`, anything else is left untouched.
        let trimmed = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
        let prefix_len = rest.len() - trimmed.len();
        let Some(value) = trimmed.strip_prefix('"') else {
            continue;
        };
        let Some(end) = value.find('"') else {
            continue;
        };
        out.push_str(&rest[..prefix_len + 1]);
        out.push_str("REDACTED\"");
        rest = &value[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Masks bearer tokens and token-bearing JSON fields before text is logged
/// or surfaced in an error.
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let mut value = redact_after(input, "Bearer ", |c| {
        c.is_whitespace() || c == '"' || c == ',' || c == ';'
    });
    for field in TOKEN_JSON_FIELDS {
        value = redact_json_string_field(&value, field);
    }

    if value == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(value)
    }
}
