//! Small shared helpers: pagination cursors and string trimming.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Encode a primary id as an opaque pagination cursor.
pub fn encode_cursor(id: i64) -> String {
    STANDARD.encode(id.to_string())
}

/// Decode a pagination cursor back to the primary id it wraps.
pub fn decode_cursor(cursor: &str) -> Option<i64> {
    let bytes = STANDARD.decode(cursor).ok()?;
    String::from_utf8(bytes).ok()?.parse().ok()
}

/// Trim a string to at most `max` characters (not bytes).
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = encode_cursor(424242);
        assert_eq!(decode_cursor(&cursor), Some(424242));
    }

    #[test]
    fn cursor_is_opaque_base64() {
        assert_eq!(encode_cursor(7), STANDARD.encode("7"));
        assert_eq!(decode_cursor("not base64!!"), None);
        assert_eq!(decode_cursor(&STANDARD.encode("not a number")), None);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("short", 500), "short");
    }
}
