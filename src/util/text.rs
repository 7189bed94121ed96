use std::borrow::Cow;

/// Ellipsis appended when text is cut.
const ELLIPSIS: &str = "...";

/// Truncates `s` to at most `max_chars` characters, appending "..." when cut.
///
/// Discord counts message limits in characters, not bytes, so this never
/// splits a code point. Returns `Cow::Borrowed` when the text already fits.
///
/// ```
/// use feedcast::util::truncate_chars;
///
/// assert_eq!(truncate_chars("Short", 10), "Short");
/// assert_eq!(truncate_chars("Hello World", 8), "Hello...");
/// assert_eq!(truncate_chars("Test", 2), "Te");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    let mut indices = s.char_indices();
    let Some((cut_at, _)) = indices.nth(max_chars) else {
        return Cow::Borrowed(s);
    };

    if max_chars <= ELLIPSIS.len() {
        return Cow::Owned(s[..cut_at].to_owned());
    }

    let keep = max_chars - ELLIPSIS.len();
    let end = s
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len());
    Cow::Owned(format!("{}{}", &s[..end], ELLIPSIS))
}

/// Strip control characters and ANSI escape sequences from upstream text.
///
/// Titles and channel names come straight from third-party XML and JSON.
/// Tab, newline and carriage return are kept. Returns `Cow::Borrowed` when
/// nothing needs removing.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    fn is_control(c: char) -> bool {
        c == '\u{7f}' || (c < '\u{20}' && c != '\t' && c != '\n' && c != '\r')
    }

    if !s.chars().any(is_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.peek() {
                // CSI: parameters until a final byte in 0x40..=0x7E
                Some('[') => {
                    chars.next();
                    for n in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ESC '\'
                Some(']') => {
                    chars.next();
                    while let Some(n) = chars.next() {
                        if n == '\u{07}' {
                            break;
                        }
                        if n == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            c if is_control(c) => {}
            c => out.push(c),
        }
    }

    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_fits_is_borrowed() {
        assert!(matches!(truncate_chars("abc", 3), Cow::Borrowed("abc")));
        assert!(matches!(truncate_chars("", 0), Cow::Borrowed("")));
    }

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        let s = "日本語のタイトルです";
        let cut = truncate_chars(s, 6);
        assert_eq!(cut, "日本語...");
        assert_eq!(cut.chars().count(), 6);
    }

    #[test]
    fn test_truncate_narrow_limits_skip_ellipsis() {
        assert_eq!(truncate_chars("Test", 0), "");
        assert_eq!(truncate_chars("Test", 3), "Tes");
    }

    #[test]
    fn test_truncate_long_message() {
        let long = "x".repeat(2500);
        let cut = truncate_chars(&long, 2000);
        assert_eq!(cut.chars().count(), 2000);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_strip_clean_text_returns_borrowed() {
        let input = "Normal title with émojis 🎉";
        assert!(matches!(strip_control_chars(input), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_preserves_whitespace_controls() {
        assert_eq!(strip_control_chars("a\tb\nc\r"), "a\tb\nc\r");
    }

    #[test]
    fn test_strip_ansi_sequences() {
        assert_eq!(strip_control_chars("\x1b[31mRed\x1b[0m"), "Red");
        assert_eq!(strip_control_chars("\x1b]0;title\x07after"), "after");
        assert_eq!(strip_control_chars("\x1b]0;title\x1b\\after"), "after");
        assert_eq!(strip_control_chars("bare\x1besc"), "bareesc");
    }

    #[test]
    fn test_strip_nul_and_del() {
        assert_eq!(strip_control_chars("a\x00b\x7fc"), "abc");
    }
}
