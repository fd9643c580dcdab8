/// Convert `\r\n` (and stray `\r`) to `\n`.
pub fn normalize_line_endings(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Remove ANSI escape sequences (CSI, OSC and two-byte escapes) from judge output.
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // parameters and intermediates, then one final byte in 0x40..=0x7e
                for c in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

/// Diagnostic text as shown to the candidate.
pub fn normalize_for_display(s: &str) -> String {
    normalize_line_endings(&strip_ansi(s))
}

/// Exact comparison after trimming both sides and normalising the expected side's line endings.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == normalize_line_endings(expected).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_expected_matches_bare_actual() {
        assert!(outputs_match("5", "5\r\n"));
        assert!(outputs_match("1\n2\n", "1\r\n2\r\n"));
        assert!(!outputs_match("1 2", "1\r\n2"));
    }

    #[test]
    fn comparison_is_case_sensitive() {
        assert!(!outputs_match("Yes", "yes"));
    }

    #[test]
    fn strips_color_sequences() {
        let input = "\x1b[31mRed\x1b[0m \x1b[1;32mGreen Bold\x1b[0m";
        assert_eq!(strip_ansi(input), "Red Green Bold");
    }

    #[test]
    fn strips_osc_titles_and_cursor_moves() {
        assert_eq!(strip_ansi("\x1b]0;title\x07\x1b[2J\x1b[HHello"), "Hello");
        assert_eq!(strip_ansi("a\x1b]8;;x\x1b\\b"), "ab");
    }

    #[test]
    fn display_normalisation_combines_both() {
        assert_eq!(
            normalize_for_display("\x1b[1merror\x1b[0m: bad\r\nline 2\r\n"),
            "error: bad\nline 2\n"
        );
    }
}
