//! The CSV reading pipeline.
//!
//! `read()` resolves the input into sources, and for each one runs the
//! generic reader: decode the bytes, locate the start of data, detect the
//! dialect and column types from a sample, allocate typed output columns,
//! then parse in parallel with ordered chunk stitching. Columns whose type
//! was bumped beyond repair during the read are rebuilt in a second pass.

pub mod chunks;
pub mod columns;
pub mod detect;
pub mod field;
pub mod parallel_reader;
pub mod parsers;
pub mod source;
pub mod tokenizer;

pub use source::{MultiSourceStrategy, Source, SourceSpec};

use crate::buffer::Buffer;
use crate::column::Column;
use crate::error::{DtError, DtResult};
use crate::frame::Frame;
use crate::parallel;
use crate::read::columns::ReadColumns;
use crate::read::parallel_reader::ReaderSettings;
use crate::read::source::resolve_sources;
use crate::read::tokenizer::Dialect;
use crate::util::encodings::{self, Encoding};
use crate::util::logger::ReadLogger;

/// Options accepted by [`read`] and [`iread`].
#[derive(Clone)]
pub struct ReadOptions {
    /// Restrict output to these column names.
    pub columns: Option<Vec<String>>,
    /// Field separator; auto-detected when absent.
    pub sep: Option<char>,
    /// Decimal mark inside floating-point fields.
    pub dec: char,
    /// Quote character; `None` auto-selects `"`.
    pub quotechar: Option<char>,
    /// Whether the first row is a header; auto-detected when absent.
    pub header: Option<bool>,
    /// Upper bound on the number of rows to read.
    pub max_nrows: Option<usize>,
    /// Tokens that read as NA.
    pub na_strings: Vec<String>,
    /// Pad ragged rows with NAs instead of failing.
    pub fill: bool,
    /// Start reading at this 1-based line.
    pub skip_to_line: Option<usize>,
    /// Start reading at the line containing this string.
    pub skip_to_string: Option<String>,
    pub skip_blank_lines: bool,
    pub strip_whitespace: bool,
    pub encoding: Encoding,
    /// Team size for the parallel read; defaults to the pool size.
    pub nthreads: Option<usize>,
    /// Advisory cap on output allocation, in bytes.
    pub memory_limit: Option<usize>,
    pub multi_source_strategy: MultiSourceStrategy,
    pub logger: Option<ReadLogger>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            columns: None,
            sep: None,
            dec: '.',
            quotechar: None,
            header: None,
            max_nrows: None,
            na_strings: vec!["NA".to_string()],
            fill: false,
            skip_to_line: None,
            skip_to_string: None,
            skip_blank_lines: true,
            strip_whitespace: true,
            encoding: Encoding::Auto,
            nthreads: None,
            memory_limit: None,
            multi_source_strategy: MultiSourceStrategy::default(),
            logger: None,
        }
    }
}

impl ReadOptions {
    fn validate(&self) -> DtResult<()> {
        if self.skip_to_line.is_some() && self.skip_to_string.is_some() {
            return Err(DtError::value_error(
                "skip_to_line and skip_to_string cannot be used together",
            ));
        }
        if let (Some(s), Some(q)) = (self.sep, self.quotechar)
            && s == q
        {
            return Err(DtError::value_error(
                "sep and quotechar cannot be the same character",
            ));
        }
        if self.dec != '.' && self.dec != ',' {
            return Err(DtError::value_error("dec must be '.' or ','"));
        }
        Ok(())
    }
}

/// Read one logical input into a frame.
pub fn read(src: impl Into<SourceSpec>, opts: &ReadOptions) -> DtResult<Frame> {
    opts.validate()?;
    let spec = src.into();
    let sources = resolve_sources(&spec)?;
    let logger = opts.logger.clone().unwrap_or_default();
    if sources.len() > 1 {
        match opts.multi_source_strategy {
            MultiSourceStrategy::One => {}
            MultiSourceStrategy::Warn => logger.warn(&format!(
                "input resolved to {} sources; reading only the first ({})",
                sources.len(),
                sources[0].name
            )),
            MultiSourceStrategy::Error => {
                return Err(DtError::value_error(format!(
                    "input resolved to {} sources; pass a single source or use iread()",
                    sources.len()
                )));
            }
            MultiSourceStrategy::All => {
                return Err(DtError::value_error(
                    "multi_source_strategy=All requires iread()",
                ));
            }
        }
    }
    let reader = GenericReader::new(opts.clone(), logger.clone());
    let frame = reader.read_source(&sources[0])?;
    logger.emit_buffered();
    Ok(frame)
}

/// Iterate over every source an input resolves to.
pub fn iread(src: impl Into<SourceSpec>, opts: &ReadOptions) -> DtResult<FrameIter> {
    opts.validate()?;
    let sources = resolve_sources(&src.into())?;
    Ok(FrameIter {
        sources,
        opts: opts.clone(),
        next_idx: 0,
    })
}

pub struct FrameIter {
    sources: Vec<Source>,
    opts: ReadOptions,
    next_idx: usize,
}

impl FrameIter {
    /// Read the next source, or `None` when exhausted.
    pub fn read_next(&mut self) -> Option<DtResult<Frame>> {
        if self.next_idx >= self.sources.len() {
            return None;
        }
        let source = &self.sources[self.next_idx];
        self.next_idx += 1;
        let logger = self.opts.logger.clone().unwrap_or_default();
        let reader = GenericReader::new(self.opts.clone(), logger.clone());
        let result = reader.read_source(source);
        logger.emit_buffered();
        Some(result)
    }

    pub fn len_remaining(&self) -> usize {
        self.sources.len() - self.next_idx
    }
}

impl Iterator for FrameIter {
    type Item = DtResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next()
    }
}

/// The front half of the reader: everything up to and including launching
/// the parallel loop.
pub struct GenericReader {
    opts: ReadOptions,
    logger: ReadLogger,
}

impl GenericReader {
    pub fn new(opts: ReadOptions, logger: ReadLogger) -> Self {
        GenericReader { opts, logger }
    }

    pub fn read_source(&self, src: &Source) -> DtResult<Frame> {
        let _section = self.logger.section(&format!("Reading {}", src.name));
        let raw = src.load()?;
        self.read_buffer(raw)
    }

    /// Run the whole pipeline over in-memory bytes.
    pub fn read_buffer(&self, raw: Buffer) -> DtResult<Frame> {
        // Decode the input encoding up front; Auto/Utf8 leave the bytes
        // alone (invalid UTF-8 inside string fields is repaired later).
        let decoded = match self.opts.encoding {
            Encoding::Auto | Encoding::Utf8 => raw,
            enc => Buffer::from_bytes(&encodings::decode_sbcs(raw.as_bytes(), enc)),
        };
        // The tokenizer wants every line to end in a newline.
        let data_buf = ensure_trailing_newline(decoded);
        let data = data_buf.as_bytes();
        let eof = data.len();

        let mut sof = 0usize;
        if data.starts_with(b"\xEF\xBB\xBF") {
            sof = 3;
        }
        let lf_present = data.contains(&b'\n');

        sof = self.apply_skip_to(data, sof, eof)?;

        // an empty (or all-whitespace) input is an empty frame, not an error
        if data[sof..eof]
            .iter()
            .all(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        {
            return Ok(Frame::new());
        }

        let base_dialect = Dialect {
            sep: b',',
            quote: self.opts.quotechar.map_or(b'"', |c| c as u8),
            dec: self.opts.dec as u8,
            strip_white: self.opts.strip_whitespace,
            blank_is_na: true,
            skip_blank_lines: self.opts.skip_blank_lines,
            lf_present,
            ..Dialect::default()
        }
        .with_na_strings(self.opts.na_strings.clone());

        let det = detect::detect(
            data,
            sof,
            eof,
            &base_dialect,
            self.opts.sep.map(|c| c as u8),
            self.opts.header,
            &self.logger,
        )?;

        let mut columns = ReadColumns::new(det.column_names.clone());
        for (col, &pt) in columns.cols.iter_mut().zip(&det.column_types) {
            col.pt = pt;
        }
        if let Some(filter) = &self.opts.columns {
            for col in &mut columns.cols {
                let keep = filter.iter().any(|f| f == &col.name);
                col.present_in_output = keep;
                col.present_in_buffer = keep;
            }
        }

        let max_nrows = self.opts.max_nrows.unwrap_or(usize::MAX);
        let input_size = eof.saturating_sub(det.data_start);
        let mut est_nrows = (input_size as f64 / det.mean_line_len.max(1.0) * 1.1) as usize + 4;
        est_nrows = est_nrows.min(max_nrows);
        if let Some(limit) = self.opts.memory_limit {
            let row_bytes: usize = columns
                .cols
                .iter()
                .filter(|c| c.present_in_buffer)
                .map(|c| c.elemsize() + if c.is_string() { 8 } else { 0 })
                .sum();
            est_nrows = est_nrows.min(limit / row_bytes.max(1));
        }
        columns.allocate(est_nrows)?;

        let settings = ReaderSettings {
            data,
            sof: det.data_start,
            eof,
            dialect: &det.dialect,
            fill: self.opts.fill,
            max_nrows,
            mean_line_len: det.mean_line_len,
            nthreads: self
                .opts
                .nthreads
                .unwrap_or_else(parallel::num_threads_in_pool),
            logger: &self.logger,
        };
        let mut outcome = parallel_reader::read_all(&settings, &mut columns)?;

        // Columns bumped at an incompatible level are rebuilt in a second
        // pass; only they occupy thread buffers this time.
        let mut passes = 0;
        while columns.any_reread_needed() {
            passes += 1;
            if passes > 3 {
                return Err(DtError::value_error(
                    "column types failed to settle after repeated re-reads",
                ));
            }
            let nrows = outcome.nrows_written;
            self.logger.info(&format!(
                "Re-reading {} column(s) whose type was bumped mid-read",
                columns.cols.iter().filter(|c| c.type_bumped).count()
            ));
            for col in &mut columns.cols {
                if col.type_bumped {
                    col.present_in_buffer = col.present_in_output;
                    col.reset_for_reread(nrows)?;
                } else {
                    col.present_in_buffer = false;
                }
            }
            columns.nrows_allocated = nrows;
            let reread_settings = ReaderSettings {
                max_nrows: nrows,
                ..settings
            };
            outcome = parallel_reader::read_all(&reread_settings, &mut columns)?;
        }

        let nrows = outcome.nrows_written;
        self.logger
            .info(&format!("Read {} rows x {} columns", nrows, columns.ncols()));

        let mut out = Vec::new();
        for col in columns.cols.drain(..) {
            if !col.present_in_output {
                continue;
            }
            let name = col.name.clone();
            let storage = col.into_storage(nrows)?;
            out.push((name, Column::Storage(storage)));
        }
        Frame::from_columns(out)
    }

    /// Apply `skip_to_line` / `skip_to_string`, both of which move the start
    /// of input before any chunking, so `max_nrows` applies to the rest.
    fn apply_skip_to(&self, data: &[u8], sof: usize, eof: usize) -> DtResult<usize> {
        if let Some(line) = self.opts.skip_to_line {
            let mut pos = sof;
            let mut current = 1usize;
            while current < line && pos < eof {
                match data[pos..eof].iter().position(|&b| b == b'\n') {
                    Some(nl) => {
                        pos += nl + 1;
                        current += 1;
                    }
                    None => {
                        return Err(DtError::value_error(format!(
                            "skip_to_line={line} is beyond the end of input"
                        )));
                    }
                }
            }
            return Ok(pos);
        }
        if let Some(pat) = &self.opts.skip_to_string {
            let needle = pat.as_bytes();
            let found = data[sof..eof]
                .windows(needle.len().max(1))
                .position(|w| w == needle)
                .ok_or_else(|| {
                    DtError::value_error(format!(
                        "skip_to_string: input does not contain {pat:?}"
                    ))
                })?;
            let abs = sof + found;
            // rewind to the start of the containing line
            let line_start = data[sof..abs]
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(sof, |p| sof + p + 1);
            return Ok(line_start);
        }
        Ok(sof)
    }
}

fn ensure_trailing_newline(buf: Buffer) -> Buffer {
    let bytes = buf.as_bytes();
    if bytes.is_empty() || bytes.ends_with(b"\n") || bytes.ends_with(b"\r") {
        return buf;
    }
    let mut owned = Vec::with_capacity(bytes.len() + 1);
    owned.extend_from_slice(bytes);
    owned.push(b'\n');
    Buffer::from_bytes(&owned)
}
