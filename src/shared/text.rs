/// Bound for persisted stdout/result text on run and step records.
pub const MAX_OUTPUT_CHARS: usize = 10_000;
/// Bound for persisted error strings.
pub const MAX_ERROR_CHARS: usize = 2_000;

/// Truncates on a char boundary and marks the cut so operators know the
/// persisted text is partial.
pub fn truncate_chars(raw: &str, max_chars: usize) -> String {
    if raw.chars().count() <= max_chars {
        return raw.to_string();
    }
    let mut out: String = raw.chars().take(max_chars).collect();
    out.push_str("…[truncated]");
    out
}

pub fn bounded_output(raw: &str) -> String {
    truncate_chars(raw, MAX_OUTPUT_CHARS)
}

pub fn bounded_error(raw: &str) -> String {
    truncate_chars(raw, MAX_ERROR_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn long_text_is_cut_and_marked() {
        let out = truncate_chars(&"x".repeat(50), 10);
        assert!(out.starts_with("xxxxxxxxxx"));
        assert!(out.ends_with("[truncated]"));
    }
}
