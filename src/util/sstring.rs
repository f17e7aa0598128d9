//! Display-width-aware strings for terminal output.
//!
//! Byte length and rendered width differ for non-ASCII text; the CLI preview
//! and the progress bar budget by terminal cells, not bytes.

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Rendered terminal width of `s`.
pub fn display_width(s: &str) -> usize {
    UnicodeWidthStr::width(s)
}

/// Truncate `s` to at most `max_width` terminal cells, appending an ellipsis
/// when anything was cut.
pub fn truncated(s: &str, max_width: usize) -> String {
    if display_width(s) <= max_width {
        return s.to_string();
    }
    let budget = max_width.saturating_sub(1);
    let mut out = String::new();
    let mut used = 0;
    for ch in s.chars() {
        let w = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + w > budget {
            break;
        }
        out.push(ch);
        used += w;
    }
    out.push('…');
    out
}

/// Left-pad or truncate `s` into a cell of exactly `width` cells.
pub fn fit_cell(s: &str, width: usize) -> String {
    let t = truncated(s, width);
    let pad = width.saturating_sub(display_width(&t));
    format!("{}{}", " ".repeat(pad), t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_width() {
        assert_eq!(display_width("hello"), 5);
        assert_eq!(truncated("hello", 10), "hello");
        assert_eq!(truncated("hello world", 6), "hello…");
    }

    #[test]
    fn test_wide_chars() {
        // CJK characters render two cells wide
        assert_eq!(display_width("数据"), 4);
        let t = truncated("数据表格", 5);
        assert!(display_width(&t) <= 5);
        assert!(t.ends_with('…'));
    }

    #[test]
    fn test_fit_cell_pads_left() {
        assert_eq!(fit_cell("42", 5), "   42");
    }
}
