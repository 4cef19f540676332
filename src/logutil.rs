//! Helpers for putting device text into the `log` stream.
//!
//! Lines coming off the serial link can carry stray control bytes (line noise,
//! half-written prompts, terminal escapes). They are escaped here so one
//! diagnostic record always stays on one line.

/// Longest device string echoed verbatim into a log record.
pub const MAX_PREVIEW: usize = 300;

/// Escape `s` for single-line logging.
///
/// `\n`, `\r`, `\t` and `\\` get their usual escapes, other control
/// characters become `\xNN`. Strings longer than [`MAX_PREVIEW`] characters
/// are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Escape raw bytes from the link, lossily decoding non-UTF-8 input first.
pub fn escape_bytes(raw: &[u8]) -> String {
    escape_log(&String::from_utf8_lossy(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_line_endings_and_terminal_bytes() {
        assert_eq!(escape_log("SC 00\r\nI>"), "SC 00\\r\\nI>");
        assert_eq!(escape_log("\u{1b}[0mO>"), "\\x1B[0mO>");
    }

    #[test]
    fn truncates_long_bursts() {
        let long = "F".repeat(MAX_PREVIEW + 20);
        let esc = escape_log(&long);
        assert_eq!(esc.chars().count(), MAX_PREVIEW + 1);
        assert!(esc.ends_with('…'));
    }

    #[test]
    fn bytes_are_decoded_lossily() {
        assert_eq!(escape_bytes(b"FC 00\xff\r"), "FC 00\u{FFFD}\\r");
    }
}
