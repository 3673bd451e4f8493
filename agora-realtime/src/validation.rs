//! Outbound message content checks.

use crate::error::ContentError;

/// Normalize `content` for sending.
///
/// Line endings become `\n`, runs of three or more newlines collapse to two,
/// surrounding whitespace is trimmed and the result is cut to `max_len`
/// characters. Applying it twice gives the same result as applying it once.
pub fn sanitize(content: &str, max_len: usize) -> String {
    let collapsed = collapse(content);
    let trimmed = collapsed.trim();
    match trimmed.char_indices().nth(max_len) {
        Some((cut, _)) => trimmed[..cut].trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

/// Check `content` and return the text that should be sent.
pub fn validate_message_content(content: &str, max_len: usize) -> Result<String, ContentError> {
    let collapsed = collapse(content);
    let trimmed = collapsed.trim();
    if trimmed.is_empty() {
        return Err(ContentError::Empty);
    }
    let len = trimmed.chars().count();
    if len > max_len {
        return Err(ContentError::TooLong { len, max: max_len });
    }
    Ok(trimmed.to_string())
}

fn collapse(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(normalized.len());
    let mut newlines = 0;
    for c in normalized.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines > 2 {
                continue;
            }
        } else {
            newlines = 0;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blank_content_is_rejected() {
        assert_eq!(validate_message_content("", 10), Err(ContentError::Empty));
        assert_eq!(validate_message_content("   ", 10), Err(ContentError::Empty));
        assert_eq!(validate_message_content("\r\n\n", 10), Err(ContentError::Empty));
    }

    #[test]
    fn long_content_is_rejected() {
        assert_eq!(
            validate_message_content("abcdef", 5),
            Err(ContentError::TooLong { len: 6, max: 5 })
        );
        assert_eq!(validate_message_content("abcde", 5).as_deref(), Ok("abcde"));
    }

    #[test]
    fn newlines_are_normalized_and_collapsed() {
        assert_eq!(sanitize("a\r\nb\rc", 100), "a\nb\nc");
        assert_eq!(sanitize("a\n\n\n\n\nb", 100), "a\n\nb");
        assert_eq!(sanitize("  hi  \n", 100), "hi");
    }

    #[test]
    fn truncation_counts_characters() {
        assert_eq!(sanitize("héllo wörld", 5), "héllo");
        assert_eq!(sanitize("ab   cd", 4), "ab");
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent(input in "[a-c \r\n\té]{0,40}", max in 1usize..30) {
            let once = sanitize(&input, max);
            prop_assert_eq!(sanitize(&once, max), once.clone());
            if !once.is_empty() {
                prop_assert_eq!(validate_message_content(&once, max), Ok(once));
            }
        }
    }
}
