//! Input dialect and column-type detection.
//!
//! The detector runs over a bounded sample: it scores separator candidates
//! by field-count consistency, settles the quote rule, decides whether the
//! first line is a header, and speculatively infers a starting parser for
//! every column by bumping from the weakest type upward. The parallel read
//! then only pays for out-of-sample bumps.

use crate::error::{DtError, DtResult};
use crate::read::field::Field64;
use crate::read::parsers::{PT, parser_fn};
use crate::read::tokenizer::{Dialect, QuoteRule, Tokenizer};
use crate::util::encodings::{self, EscapeCheck};
use crate::util::logger::ReadLogger;

const MAX_SAMPLE_LINES: usize = 100;
const MAX_JUMP_POINTS: usize = 10;

pub struct Detection {
    pub dialect: Dialect,
    pub ncols: usize,
    pub header: bool,
    pub column_names: Vec<String>,
    pub column_types: Vec<PT>,
    pub mean_line_len: f64,
    /// Start of data rows (past the header line when there is one).
    pub data_start: usize,
}

/// Candidate separators in preference order.
const SEP_CANDIDATES: [u8; 6] = [b',', b';', b'\t', b'|', b':', b' '];

pub fn detect(
    data: &[u8],
    sof: usize,
    eof: usize,
    base: &Dialect,
    sep_override: Option<u8>,
    header_override: Option<bool>,
    logger: &ReadLogger,
) -> DtResult<Detection> {
    let _section = logger.section("Detecting input dialect");

    let mut best: Option<(Dialect, usize, usize)> = None; // dialect, ncols, score
    let seps: Vec<u8> = match sep_override {
        Some(s) => vec![s],
        None => SEP_CANDIDATES.to_vec(),
    };
    for &sep in &seps {
        for rule in [
            QuoteRule::Doubled,
            QuoteRule::Escaped,
            QuoteRule::Permissive,
            QuoteRule::None,
        ] {
            let dialect = Dialect {
                sep,
                quote_rule: rule,
                ..base.clone()
            };
            if let Some((ncols, score)) = score_dialect(data, sof, eof, &dialect) {
                let score = if sep == b' ' { score / 2 } else { score };
                let better = match &best {
                    None => true,
                    Some((_, _, s)) => score > *s,
                };
                if better {
                    best = Some((dialect, ncols, score));
                }
            }
        }
    }
    let (mut dialect, ncols, _score) = best.ok_or_else(|| {
        DtError::value_error("unable to detect a consistent field separator in the input")
    })?;
    if dialect.quote_rule == QuoteRule::None {
        // under the no-quoting rule the quote char is ordinary content
        dialect.quote = 0;
    }
    logger.info(&format!(
        "Using sep='{}' quote_rule={:?}: {} columns",
        dialect.sep as char, dialect.quote_rule, ncols
    ));

    // First line: candidate header names.
    let mut tok = Tokenizer::new(data, &dialect);
    tok.ch = sof;
    tok.eof = eof;
    let (first_fields, first_line_end) = read_line_fields(&mut tok, ncols);
    let first_types = infer_line_types(data, sof, eof, &dialect, ncols);

    // Body sample: jump points spread over the input.
    let mut sample = SampleStats::default();
    let body_start = first_line_end;
    let body_types = infer_sample_types(data, body_start, eof, &dialect, ncols, &mut sample);

    let header = match header_override {
        Some(h) => h,
        None => {
            let first_all_str = first_types
                .iter()
                .all(|&t| t.is_string() || t == PT::Mu);
            let body_any_nonstr = body_types
                .iter()
                .any(|&t| !t.is_string() && t != PT::Mu);
            // an all-string table is assumed to carry a header too
            first_all_str && (body_any_nonstr || !first_fields.is_empty())
        }
    };
    logger.info(&format!("Header detected: {header}"));

    let column_names = if header {
        let mut names = Vec::with_capacity(ncols);
        for (i, f) in first_fields.iter().enumerate() {
            if f.is_empty() {
                names.push(format!("C{i}"));
            } else {
                names.push(f.clone());
            }
        }
        while names.len() < ncols {
            names.push(format!("C{}", names.len()));
        }
        names
    } else {
        (0..ncols).map(|i| format!("C{i}")).collect()
    };

    let (column_types, data_start) = if header {
        (body_types, body_start)
    } else {
        // the first line is data: fold its types in
        let mut types = body_types;
        for (t, &ft) in types.iter_mut().zip(&first_types) {
            if ft > *t {
                *t = ft;
            }
        }
        (types, sof)
    };

    let mean_line_len = if sample.nlines > 0 {
        sample.total_len as f64 / sample.nlines as f64
    } else if first_line_end > sof {
        (first_line_end - sof) as f64
    } else {
        40.0
    };
    logger.info(&format!(
        "Sampled {} lines, mean line length {:.1}",
        sample.nlines, mean_line_len
    ));

    Ok(Detection {
        dialect,
        ncols,
        header,
        column_names,
        column_types,
        mean_line_len,
        data_start,
    })
}

/// Field-count consistency score for a dialect over the first sample lines.
/// Returns the modal field count and a score, or `None` when the dialect
/// cannot tokenize the sample.
fn score_dialect(data: &[u8], sof: usize, eof: usize, dialect: &Dialect) -> Option<(usize, usize)> {
    let mut tok = Tokenizer::new(data, dialect);
    tok.ch = sof;
    tok.eof = eof;
    let mut counts = Vec::new();
    for _ in 0..MAX_SAMPLE_LINES {
        if tok.at_eof() {
            break;
        }
        match tok.count_fields() {
            Some(0) => continue,
            Some(n) => counts.push(n),
            None => return None,
        }
    }
    if counts.is_empty() {
        return None;
    }
    let mut modal = counts[0];
    let mut modal_hits = 0usize;
    for &c in &counts {
        let hits = counts.iter().filter(|&&x| x == c).count();
        if hits > modal_hits || (hits == modal_hits && c > modal) {
            modal = c;
            modal_hits = hits;
        }
    }
    if modal == 1 && counts.len() > 1 && modal_hits < counts.len() {
        return None;
    }
    Some((modal, modal_hits * 1000 + modal))
}

/// Parse one line as string fields, returning decoded names and the
/// position just past the line's EOL.
fn read_line_fields(tok: &mut Tokenizer<'_>, ncols: usize) -> (Vec<String>, usize) {
    let mut fields = Vec::with_capacity(ncols);
    let echar = match tok.dialect.quote_rule {
        QuoteRule::Doubled => tok.dialect.quote,
        QuoteRule::Escaped => b'\\',
        _ => 0xFF,
    };
    loop {
        let mut target = Field64::default();
        crate::read::parsers::parse_string_core(tok, &mut target, false);
        let (off, len) = target.get_str();
        let raw = &tok.data[tok.anchor + off as usize..tok.anchor + (off + len.max(0)) as usize];
        let mut decoded = Vec::with_capacity(raw.len());
        match encodings::check_escaped_string(raw, echar) {
            EscapeCheck::Clean => decoded.extend_from_slice(raw),
            EscapeCheck::HasEscapes => encodings::decode_escaped(raw, echar, &mut decoded),
            EscapeCheck::NotUtf8 => {
                let mut repaired = Vec::new();
                encodings::decode_win1252(raw, &mut repaired);
                encodings::decode_escaped(&repaired, echar, &mut decoded);
            }
        }
        fields.push(String::from_utf8_lossy(&decoded).into_owned());
        if tok.cur() == tok.dialect.sep && !tok.at_eof() {
            tok.ch += 1;
            continue;
        }
        tok.skip_eol();
        break;
    }
    (fields, tok.ch)
}

#[derive(Default)]
struct SampleStats {
    nlines: usize,
    total_len: usize,
}

/// Infer the starting parser of each column from sample lines taken at
/// several jump points across `[start, eof)`.
fn infer_sample_types(
    data: &[u8],
    start: usize,
    eof: usize,
    dialect: &Dialect,
    ncols: usize,
    sample: &mut SampleStats,
) -> Vec<PT> {
    let mut types = vec![PT::Mu; ncols];
    if start >= eof {
        return types;
    }
    let size = eof - start;
    let njumps = if size < 1 << 16 { 1 } else { MAX_JUMP_POINTS };
    let lines_per_jump = MAX_SAMPLE_LINES / njumps;
    for jump in 0..njumps {
        let mut tok = Tokenizer::new(data, dialect);
        tok.eof = eof;
        tok.ch = start + jump * size / njumps;
        if jump > 0 && !tok.next_good_line(ncols, false) {
            continue;
        }
        for _ in 0..lines_per_jump {
            if tok.at_eof() {
                break;
            }
            let line_start = tok.ch;
            if !infer_line(&mut tok, dialect, &mut types) {
                break;
            }
            sample.nlines += 1;
            sample.total_len += tok.ch - line_start;
        }
    }
    types
}

/// Types of a single line, in isolation.
fn infer_line_types(
    data: &[u8],
    start: usize,
    eof: usize,
    dialect: &Dialect,
    ncols: usize,
) -> Vec<PT> {
    let mut types = vec![PT::Mu; ncols];
    let mut tok = Tokenizer::new(data, dialect);
    tok.ch = start;
    tok.eof = eof;
    infer_line(&mut tok, dialect, &mut types);
    types
}

/// Parse one line, bumping `types` per field as needed. Advances past the
/// line's EOL; returns false when the line does not fit `types.len()`
/// columns.
fn infer_line(tok: &mut Tokenizer<'_>, dialect: &Dialect, types: &mut [PT]) -> bool {
    if dialect.skip_blank_lines && tok.skip_eol() {
        return true;
    }
    let sep = dialect.sep;
    let quote = dialect.quote;
    let mut target = Field64::default();
    for j in 0..types.len() {
        let field_start = tok.ch;
        let mut pt = types[j];
        loop {
            tok.ch = field_start;
            let mut quoted = false;
            if !pt.is_string() {
                tok.skip_white();
                let after_space = tok.ch;
                tok.ch = tok.end_na_string(after_space);
                tok.skip_white();
                if !tok.end_of_field() {
                    tok.ch = after_space;
                }
                if quote != 0 && tok.cur() == quote {
                    quoted = true;
                    tok.ch += 1;
                }
            }
            parser_fn(pt)(tok, &mut target);
            let mut ok = true;
            if quoted {
                if tok.cur() == quote {
                    tok.ch += 1;
                } else {
                    ok = false;
                }
            }
            if ok {
                tok.skip_white();
                if tok.end_of_field() {
                    break;
                }
            }
            match pt.successor(sep) {
                Some(next) => pt = next,
                None => return false,
            }
        }
        types[j] = types[j].max(pt);
        if tok.cur() == sep && !tok.at_eof() {
            tok.ch += 1;
            continue;
        }
        if j + 1 < types.len() {
            // ragged line; inference just stops here
            tok.skip_eol();
            return true;
        }
    }
    if !tok.skip_eol() && !tok.at_eof() {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect_str(text: &str) -> Detection {
        let logger = ReadLogger::new();
        let base = Dialect::default();
        detect(
            text.as_bytes(),
            0,
            text.len(),
            &base,
            None,
            None,
            &logger,
        )
        .unwrap()
    }

    #[test]
    fn test_detect_comma_with_header() {
        let d = detect_str("a,b,c\n1,2,3\n4,5,6\n");
        assert_eq!(d.dialect.sep, b',');
        assert_eq!(d.ncols, 3);
        assert!(d.header);
        assert_eq!(d.column_names, vec!["a", "b", "c"]);
        // "1" alone would pass as bool, but 4 bumps the column to int32
        assert_eq!(d.column_types, vec![PT::Int32, PT::Int32, PT::Int32]);
    }

    #[test]
    fn test_detect_semicolon() {
        let d = detect_str("x;y\n1;2\n3;4\n");
        assert_eq!(d.dialect.sep, b';');
        assert_eq!(d.ncols, 2);
    }

    #[test]
    fn test_detect_no_header() {
        let d = detect_str("1,2\n3,4\n5,6\n");
        assert!(!d.header);
        assert_eq!(d.column_names, vec!["C0", "C1"]);
    }

    #[test]
    fn test_detect_types_mixed() {
        let d = detect_str("n,s,f\n1,abc,0.5\n2,def,1.25\n");
        assert!(d.header);
        assert_eq!(d.column_types[0], PT::Int32);
        assert!(d.column_types[1].is_string());
        assert_eq!(d.column_types[2], PT::Float64Plain);
    }

    #[test]
    fn test_detect_single_column_header() {
        let d = detect_str("s\nalpha\nbeta\n");
        assert_eq!(d.ncols, 1);
        assert!(d.header);
        assert_eq!(d.column_names, vec!["s"]);
    }
}
