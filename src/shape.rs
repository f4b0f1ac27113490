//! Presentation-layer shaping of storage rows.
//!
//! Long text fields are truncated to a fixed character count for list
//! views; this is a response transform only and never touches storage.

/// Maximum characters for post summaries in list/search views.
pub const POST_SUMMARY_MAX_CHARS: usize = 160;

/// Maximum characters for review content in product listings.
pub const REVIEW_SUMMARY_MAX_CHARS: usize = 255;

/// Truncate `text` to at most `max_chars` characters, suffixing an
/// ellipsis when anything was cut. Operates on characters, not bytes, so
/// multibyte content never splits mid-scalar.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_untouched() {
        assert_eq!(truncate_with_ellipsis("hello", 80), "hello");
    }

    #[test]
    fn test_exact_length_untouched() {
        let text = "a".repeat(80);
        assert_eq!(truncate_with_ellipsis(&text, 80), text);
    }

    #[test]
    fn test_long_text_truncated_with_ellipsis() {
        let text = "x".repeat(200);
        let shaped = truncate_with_ellipsis(&text, 80);
        assert_eq!(shaped.chars().count(), 83);
        assert!(shaped.ends_with("..."));
    }

    #[test]
    fn test_trailing_whitespace_trimmed_before_ellipsis() {
        let text = format!("{}   tail", "word ".repeat(30));
        let shaped = truncate_with_ellipsis(&text, 20);
        assert!(!shaped.contains(" ..."));
        assert!(shaped.ends_with("..."));
    }

    #[test]
    fn test_multibyte_content_is_safe() {
        let text = "héllo wörld ".repeat(20);
        let shaped = truncate_with_ellipsis(&text, 15);
        assert!(shaped.ends_with("..."));
        assert!(shaped.chars().count() <= 18);
    }
}
