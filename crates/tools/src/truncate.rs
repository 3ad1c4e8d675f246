//! Unicode-safe truncation, shared by the tool executor and the runner for
//! every "truncated to N chars" requirement in §4.4/§4.5/§7.

/// Truncate `s` to at most `max_chars` characters, appending `"..."` when
/// truncation actually happened. Operates on `char` boundaries so multi-byte
/// UTF-8 (including emoji) is never split mid-codepoint.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_string_is_unchanged() {
        assert_eq!(truncate_str("hello", 10), "hello");
    }

    #[test]
    fn long_string_is_truncated_with_ellipsis() {
        assert_eq!(truncate_str("hello world", 5), "hello...");
    }

    #[test]
    fn exact_length_is_unchanged() {
        assert_eq!(truncate_str("hello", 5), "hello");
    }

    #[test]
    fn zero_max_returns_empty() {
        assert_eq!(truncate_str("hello", 0), "");
    }

    #[test]
    fn multibyte_chars_not_split() {
        let s = "日本語のテキストです";
        let truncated = truncate_str(s, 3);
        assert_eq!(truncated, "日本語...");
    }

    #[test]
    fn emoji_not_split() {
        let s = "👍👍👍👍👍";
        let truncated = truncate_str(s, 2);
        assert_eq!(truncated, "👍👍...");
    }
}
