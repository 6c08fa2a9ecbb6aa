/// Lexical context of the byte under the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum State {
    Normal,
    /// Inside a `'...'` literal or `"..."` identifier; holds the quote byte.
    Quoted(u8),
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

fn pair_at(bytes: &[u8], idx: usize, pair: [u8; 2]) -> bool {
    bytes.get(idx..idx + 2) == Some(&pair[..])
}

pub(super) fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    pair_at(bytes, idx, *b"--")
}

pub(super) fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    pair_at(bytes, idx, *b"/*")
}

pub(super) fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    pair_at(bytes, idx, *b"*/")
}

/// ASCII digits starting at `start`, with the index one past the last digit.
pub(super) fn scan_digits(bytes: &[u8], start: usize) -> Option<(usize, &str)> {
    let len = bytes
        .get(start..)?
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if len == 0 {
        return None;
    }
    let end = start + len;
    std::str::from_utf8(&bytes[start..end])
        .ok()
        .map(|digits| (end, digits))
}

/// Opening `$tag$` at `start`: the tag and the index of its closing `$`.
pub(super) fn try_start_dollar_quote(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let rest = bytes.get(start + 1..)?;
    let len = rest.iter().position(|b| *b == b'$')?;
    let tag = &rest[..len];
    let word = |b: &u8| b.is_ascii_alphanumeric() || *b == b'_';
    if tag.first().is_some_and(u8::is_ascii_digit) || !tag.iter().all(word) {
        return None;
    }
    let tag = std::str::from_utf8(tag).ok()?.to_owned();
    Some((tag, start + 1 + len))
}

/// Whether a closing `$tag$` begins at `idx`.
pub(super) fn matches_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    bytes.get(idx + 1..end) == Some(tag.as_bytes()) && bytes.get(end) == Some(&b'$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_tags() {
        assert_eq!(
            try_start_dollar_quote(b"$body$ x", 0),
            Some(("body".to_owned(), 5))
        );
        assert_eq!(try_start_dollar_quote(b"$$", 0), Some((String::new(), 1)));
        assert_eq!(try_start_dollar_quote(b"$1, $2", 0), None);
        assert_eq!(try_start_dollar_quote(b"$1$", 0), None);
        assert!(matches_tag(b"x $body$", 2, "body"));
        assert!(!matches_tag(b"x $bod", 2, "body"));
    }

    #[test]
    fn digits() {
        assert_eq!(scan_digits(b"?12 ", 1), Some((3, "12")));
        assert_eq!(scan_digits(b"? ", 1), None);
        assert_eq!(scan_digits(b"?", 1), None);
    }
}
