/// Maximum size of a stored program output or error message (bytes)
pub const MAX_STORED_OUTPUT: usize = 4096;

/// Trimmed exact-string comparison: trailing whitespace on either side is ignored.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim_end() == expected.trim_end()
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}
