//! The CSV tokenizer: cursor state, dialect settings, and field navigation.

use std::sync::Arc;

use crate::read::field::Field64;

/// Quote handling rules, auto-detected per input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuoteRule {
    /// Quotes inside quoted fields are doubled: `""` -> `"`.
    #[default]
    Doubled = 0,
    /// Quotes inside quoted fields are backslash-escaped.
    Escaped = 1,
    /// Permissive: a quote only closes the field when followed by the
    /// separator or end of line.
    Permissive = 2,
    /// No quoting at all.
    None = 3,
}

/// Dialect settings shared by every tokenizer of one read.
#[derive(Debug, Clone)]
pub struct Dialect {
    pub sep: u8,
    pub quote: u8,
    pub dec: u8,
    pub quote_rule: QuoteRule,
    pub strip_white: bool,
    pub blank_is_na: bool,
    pub skip_blank_lines: bool,
    /// Whether the input contains `\n` at all; when it does not, a lone
    /// `\r` terminates lines.
    pub lf_present: bool,
    pub na_strings: Arc<Vec<String>>,
    /// Whether NA strings may appear inside otherwise-numeric fields.
    pub numbers_may_be_nas: bool,
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect {
            sep: b',',
            quote: b'"',
            dec: b'.',
            quote_rule: QuoteRule::Doubled,
            strip_white: true,
            blank_is_na: true,
            skip_blank_lines: true,
            lf_present: true,
            na_strings: Arc::new(vec!["NA".to_string()]),
            numbers_may_be_nas: false,
        }
    }
}

impl Dialect {
    pub fn with_na_strings(mut self, na: Vec<String>) -> Self {
        self.numbers_may_be_nas = na.iter().any(|s| {
            let t = s.trim();
            !t.is_empty() && (t.parse::<f64>().is_ok() || t.starts_with(['+', '-']))
        });
        self.na_strings = Arc::new(na);
        self
    }
}

/// Scanning state over one input region.
pub struct Tokenizer<'a> {
    pub data: &'a [u8],
    /// Current position.
    pub ch: usize,
    /// End of input (exclusive).
    pub eof: usize,
    /// Base position for string-field offsets.
    pub anchor: usize,
    pub dialect: &'a Dialect,
}

impl<'a> Tokenizer<'a> {
    pub fn new(data: &'a [u8], dialect: &'a Dialect) -> Self {
        Tokenizer {
            data,
            ch: 0,
            eof: data.len(),
            anchor: 0,
            dialect,
        }
    }

    /// Byte at `i`, or 0 past the end (NUL never occurs in text fields, so
    /// it doubles as an end-of-input sentinel).
    #[inline]
    pub fn at(&self, i: usize) -> u8 {
        if i < self.eof { self.data[i] } else { 0 }
    }

    #[inline]
    pub fn cur(&self) -> u8 {
        self.at(self.ch)
    }

    #[inline]
    pub fn at_eof(&self) -> bool {
        self.ch >= self.eof
    }

    /// Consume an end-of-line sequence at the cursor. Handles `\n`, `\r\n`,
    /// `\r\r\n`, and a lone `\r` when the input has no `\n` at all.
    pub fn skip_eol(&mut self) -> bool {
        match self.cur() {
            b'\n' => {
                // \n, possibly preceded-by-nothing; tolerate \n\r pairs
                self.ch += 1;
                if self.cur() == b'\r' && !self.dialect.lf_present {
                    self.ch += 1;
                }
                true
            }
            b'\r' => {
                if self.at(self.ch + 1) == b'\n' {
                    self.ch += 2;
                    true
                } else if self.at(self.ch + 1) == b'\r' && self.at(self.ch + 2) == b'\n' {
                    self.ch += 3;
                    true
                } else if !self.dialect.lf_present {
                    self.ch += 1;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Whether the cursor sits on an end-of-line sequence (without moving).
    pub fn at_eol(&self) -> bool {
        match self.cur() {
            b'\n' => true,
            b'\r' => {
                self.at(self.ch + 1) == b'\n'
                    || (self.at(self.ch + 1) == b'\r' && self.at(self.ch + 2) == b'\n')
                    || !self.dialect.lf_present
            }
            _ => false,
        }
    }

    /// Skip field-internal whitespace: spaces, and tabs unless tab is the
    /// separator.
    pub fn skip_white(&mut self) {
        if self.dialect.sep == b' ' {
            return;
        }
        while self.cur() == b' ' || (self.cur() == b'\t' && self.dialect.sep != b'\t') {
            self.ch += 1;
        }
    }

    /// Whether the cursor is at a field boundary: separator, EOL or EOF.
    pub fn end_of_field(&self) -> bool {
        let c = self.cur();
        c == self.dialect.sep || self.at_eof() || self.at_eol()
    }

    /// If an NA string starts at `start`, the position just past the longest
    /// match; otherwise `start`.
    pub fn end_na_string(&self, start: usize) -> usize {
        let mut longest = start;
        for na in self.dialect.na_strings.iter() {
            let bytes = na.as_bytes();
            if bytes.is_empty() {
                continue;
            }
            let end = start + bytes.len();
            if end <= self.eof && &self.data[start..end] == bytes && end > longest {
                longest = end;
            }
        }
        longest
    }

    /// Whether the whole field `[start, end)` is an NA string (with optional
    /// surrounding whitespace when stripping).
    pub fn field_is_na_string(&self, start: usize, end: usize) -> bool {
        let field = &self.data[start..end];
        self.dialect
            .na_strings
            .iter()
            .any(|na| na.as_bytes() == field)
    }

    /// Count the fields of the line starting at the cursor, advancing past
    /// its EOL. `None` when the line cannot be tokenized under the current
    /// dialect (e.g. an unterminated quote).
    pub fn count_fields(&mut self) -> Option<usize> {
        if self.at_eof() {
            return None;
        }
        let sep = self.dialect.sep;
        let mut ncols = 1usize;
        if sep == b' ' {
            while self.cur() == b' ' {
                self.ch += 1;
            }
        }
        if self.skip_eol() {
            return Some(0);
        }
        loop {
            let mut target = Field64::default();
            let before = self.ch;
            crate::read::parsers::parse_string_core(self, &mut target, false);
            if self.ch == before && !self.end_of_field() {
                return None;
            }
            if sep == b' ' && self.cur() == b' ' {
                while self.cur() == b' ' {
                    self.ch += 1;
                }
                if self.at_eof() || self.at_eol() {
                    self.skip_eol();
                    return Some(ncols);
                }
                ncols += 1;
                continue;
            }
            if self.cur() == sep {
                self.ch += 1;
                ncols += 1;
                continue;
            }
            if self.at_eof() {
                return Some(ncols);
            }
            if self.skip_eol() {
                return Some(ncols);
            }
            return None;
        }
    }

    /// Move the cursor to the next plausible start of a line at or after the
    /// current position. Used to recover line boundaries inside a chunk with
    /// an approximate start. Requires `ncols` consistency from two
    /// consecutive candidate lines, which guards against landing inside a
    /// quoted field that contains newlines.
    pub fn next_good_line(&mut self, ncols: usize, fill: bool) -> bool {
        // move to just past the next EOL, unless already at a line start
        if self.ch > 0 {
            while !self.at_eof() && !self.skip_eol() {
                self.ch += 1;
            }
        }
        let accept = |n: usize| n == ncols || (fill && n > 0) || (ncols == 1 && n > 0);
        for _attempt in 0..100 {
            if self.at_eof() {
                self.ch = self.eof;
                return true;
            }
            let candidate = self.ch;
            let mut probe = Tokenizer {
                data: self.data,
                ch: candidate,
                eof: self.eof,
                anchor: self.anchor,
                dialect: self.dialect,
            };
            let first = probe.count_fields();
            let ok = match first {
                Some(0) => true, // blank line; a fine place to restart
                Some(n) if accept(n) => {
                    // second consecutive line must agree (or be the end)
                    if probe.at_eof() {
                        true
                    } else {
                        match probe.count_fields() {
                            None => false,
                            Some(0) => true,
                            Some(m) => accept(m) || probe.at_eof(),
                        }
                    }
                }
                _ => false,
            };
            if ok {
                self.ch = candidate;
                return true;
            }
            // skip one line and try again
            while !self.at_eof() && !self.skip_eol() {
                self.ch += 1;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok<'a>(data: &'a [u8], dialect: &'a Dialect) -> Tokenizer<'a> {
        Tokenizer::new(data, dialect)
    }

    #[test]
    fn test_skip_eol_variants() {
        let d = Dialect::default();
        let mut t = tok(b"\r\nx", &d);
        assert!(t.skip_eol());
        assert_eq!(t.ch, 2);

        let mut t = tok(b"\nx", &d);
        assert!(t.skip_eol());
        assert_eq!(t.ch, 1);

        // lone \r is not an EOL while the file contains \n
        let mut t = tok(b"\rx", &d);
        assert!(!t.skip_eol());

        let d2 = Dialect {
            lf_present: false,
            ..Dialect::default()
        };
        let mut t = tok(b"\rx", &d2);
        assert!(t.skip_eol());
        assert_eq!(t.ch, 1);
    }

    #[test]
    fn test_count_fields() {
        let d = Dialect::default();
        let mut t = tok(b"a,b,c\n1,2,3\n", &d);
        assert_eq!(t.count_fields(), Some(3));
        assert_eq!(t.count_fields(), Some(3));
        assert!(t.at_eof());
    }

    #[test]
    fn test_count_fields_quoted_comma() {
        let d = Dialect::default();
        let mut t = tok(b"\"a,b\",c\n", &d);
        assert_eq!(t.count_fields(), Some(2));
    }

    #[test]
    fn test_next_good_line_lands_on_boundary() {
        let d = Dialect::default();
        let data = b"aaa,bbb,ccc\nddd,eee,fff\nggg,hhh,iii\n";
        // start mid-way inside the first line
        let mut t = tok(data, &d);
        t.ch = 5;
        assert!(t.next_good_line(3, false));
        assert_eq!(t.ch, 12); // start of the second line
    }

    #[test]
    fn test_next_good_line_rejects_quoted_newline_interior() {
        let d = Dialect::default();
        // the newline inside the quoted field is a trap: the text after it
        // has the wrong field count
        let data = b"a,b\n\"x\ny,z,w\",3\nq,4\n";
        let mut t = tok(data, &d);
        t.ch = 6; // inside the quoted field, right before "y,z,w"
        assert!(t.next_good_line(2, false));
        // lands on the real line start ("q,4"), not inside the quoted field
        assert_eq!(&data[t.ch..t.ch + 3], b"q,4");
    }

    #[test]
    fn test_na_string_match() {
        let d = Dialect::default();
        let t = tok(b"NA,x", &d);
        assert_eq!(t.end_na_string(0), 2);
        assert!(t.field_is_na_string(0, 2));
        assert!(!t.field_is_na_string(0, 1));
    }
}
