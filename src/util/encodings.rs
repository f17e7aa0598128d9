//! Single-byte character set decoding and CSV escape handling.
//!
//! All engine strings are UTF-8 internally. Input read under a non-UTF-8
//! encoding is decoded up front; invalid UTF-8 discovered inside string
//! fields during a read is repaired with the Windows-1252 fallback, the
//! common culprit for stray high bytes in otherwise-ASCII files.

/// Supported input encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Auto,
    Utf8,
    Latin1,
    Win1251,
    Win1252,
    Iso8859,
}

impl Encoding {
    pub fn parse(name: &str) -> Option<Encoding> {
        match name.to_ascii_lowercase().as_str() {
            "auto" => Some(Encoding::Auto),
            "utf-8" | "utf8" => Some(Encoding::Utf8),
            "latin-1" | "latin1" => Some(Encoding::Latin1),
            "win-1251" | "windows-1251" | "cp1251" => Some(Encoding::Win1251),
            "win-1252" | "windows-1252" | "cp1252" => Some(Encoding::Win1252),
            "iso-8859" | "iso-8859-1" => Some(Encoding::Iso8859),
            _ => None,
        }
    }
}

/// Windows-1252 codepoints for bytes 0x80..0xA0; the rest coincide with
/// Latin-1. Undefined slots decode to U+FFFD.
const WIN1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{FFFD}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{FFFD}', '\u{017D}', '\u{FFFD}',
    '\u{FFFD}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{FFFD}', '\u{017E}', '\u{0178}',
];

/// Windows-1251 codepoints for bytes 0x80..0xC0; bytes 0xC0..0x100 map
/// linearly onto U+0410..U+0450.
const WIN1251_HIGH: [char; 64] = [
    '\u{0402}', '\u{0403}', '\u{201A}', '\u{0453}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{20AC}', '\u{2030}', '\u{0409}', '\u{2039}', '\u{040A}', '\u{040C}', '\u{040B}', '\u{040F}',
    '\u{0452}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{FFFD}', '\u{2122}', '\u{0459}', '\u{203A}', '\u{045A}', '\u{045C}', '\u{045B}', '\u{045F}',
    '\u{00A0}', '\u{040E}', '\u{045E}', '\u{0408}', '\u{00A4}', '\u{0490}', '\u{00A6}', '\u{00A7}',
    '\u{0401}', '\u{00A9}', '\u{0404}', '\u{00AB}', '\u{00AC}', '\u{00AD}', '\u{00AE}', '\u{0407}',
    '\u{00B0}', '\u{00B1}', '\u{0406}', '\u{0456}', '\u{0491}', '\u{00B5}', '\u{00B6}', '\u{00B7}',
    '\u{0451}', '\u{2116}', '\u{0454}', '\u{00BB}', '\u{0458}', '\u{0405}', '\u{0455}', '\u{0457}',
];

fn byte_to_char(b: u8, encoding: Encoding) -> char {
    debug_assert!(b >= 0x80);
    match encoding {
        Encoding::Latin1 | Encoding::Iso8859 => b as char,
        Encoding::Win1252 => {
            if b < 0xA0 {
                WIN1252_HIGH[(b - 0x80) as usize]
            } else {
                b as char
            }
        }
        Encoding::Win1251 => {
            if b < 0xC0 {
                WIN1251_HIGH[(b - 0x80) as usize]
            } else {
                char::from_u32(0x0410 + (b - 0xC0) as u32).unwrap()
            }
        }
        _ => b as char,
    }
}

/// Decode a whole byte buffer from a single-byte code page into UTF-8.
pub fn decode_sbcs(src: &[u8], encoding: Encoding) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 4);
    for &b in src {
        if b < 0x80 {
            out.push(b);
        } else {
            let mut tmp = [0u8; 4];
            out.extend_from_slice(byte_to_char(b, encoding).encode_utf8(&mut tmp).as_bytes());
        }
    }
    out
}

/// Append `src` decoded from Windows-1252 to `out` (the repair fallback for
/// invalid UTF-8 inside string fields).
pub fn decode_win1252(src: &[u8], out: &mut Vec<u8>) {
    for &b in src {
        if b < 0x80 {
            out.push(b);
        } else {
            let mut tmp = [0u8; 4];
            out.extend_from_slice(
                byte_to_char(b, Encoding::Win1252)
                    .encode_utf8(&mut tmp)
                    .as_bytes(),
            );
        }
    }
}

/// Result of scanning a field for escapes and UTF-8 validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeCheck {
    /// Valid UTF-8, no escape characters: usable as-is.
    Clean,
    /// Valid UTF-8 but contains the escape character.
    HasEscapes,
    /// Not valid UTF-8; needs the code-page repair.
    NotUtf8,
}

/// Scan `src` for validity and for occurrences of the escape char `ech`
/// (the quote char under quote rule 0, backslash under rule 1).
pub fn check_escaped_string(src: &[u8], ech: u8) -> EscapeCheck {
    if std::str::from_utf8(src).is_err() {
        return EscapeCheck::NotUtf8;
    }
    if src.contains(&ech) {
        EscapeCheck::HasEscapes
    } else {
        EscapeCheck::Clean
    }
}

/// Append `src` to `out` with CSV escapes resolved: doubled quotes when
/// `ech` is the quote character, backslash escapes when `ech == b'\\'`.
/// Invalid sequences are copied through rather than rejected.
pub fn decode_escaped(src: &[u8], ech: u8, out: &mut Vec<u8>) {
    let mut i = 0;
    while i < src.len() {
        let b = src[i];
        if b == ech && ech == b'\\' {
            if i + 1 < src.len() {
                let c = src[i + 1];
                let decoded = match c {
                    b'n' => b'\n',
                    b't' => b'\t',
                    b'r' => b'\r',
                    b'0' => b'\0',
                    other => other,
                };
                out.push(decoded);
                i += 2;
            } else {
                out.push(b);
                i += 1;
            }
        } else if b == ech {
            // doubled quote
            out.push(b);
            i += if i + 1 < src.len() && src[i + 1] == ech {
                2
            } else {
                1
            };
        } else {
            out.push(b);
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_decode() {
        let decoded = decode_sbcs(b"caf\xe9", Encoding::Latin1);
        assert_eq!(std::str::from_utf8(&decoded).unwrap(), "café");
    }

    #[test]
    fn test_win1252_specials() {
        let decoded = decode_sbcs(b"\x80 \x93x\x94", Encoding::Win1252);
        assert_eq!(std::str::from_utf8(&decoded).unwrap(), "€ \u{201C}x\u{201D}");
    }

    #[test]
    fn test_win1251_cyrillic() {
        let decoded = decode_sbcs(b"\xcf\xf0\xe8\xe2\xe5\xf2", Encoding::Win1251);
        assert_eq!(std::str::from_utf8(&decoded).unwrap(), "Привет");
    }

    #[test]
    fn test_check_escaped() {
        assert_eq!(check_escaped_string(b"plain", b'"'), EscapeCheck::Clean);
        assert_eq!(
            check_escaped_string(b"say \"\"hi\"\"", b'"'),
            EscapeCheck::HasEscapes
        );
        assert_eq!(check_escaped_string(b"bad \xff byte", b'"'), EscapeCheck::NotUtf8);
    }

    #[test]
    fn test_decode_doubled_quotes() {
        let mut out = Vec::new();
        decode_escaped(b"say \"\"hi\"\"", b'"', &mut out);
        assert_eq!(out, b"say \"hi\"");
    }

    #[test]
    fn test_decode_backslash_escapes() {
        let mut out = Vec::new();
        decode_escaped(br"a\tb\nc\\d", b'\\', &mut out);
        assert_eq!(out, b"a\tb\nc\\d");
    }

    #[test]
    fn test_win1252_repair() {
        let mut out = Vec::new();
        decode_win1252(b"it\x92s", &mut out);
        assert_eq!(std::str::from_utf8(&out).unwrap(), "it\u{2019}s");
    }
}
