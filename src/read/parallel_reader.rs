//! The ordered parallel read loop.
//!
//! Chunks of the input are parsed concurrently into thread-local buffers;
//! the ordered phase stitches chunk boundaries, assigns output row ranges,
//! grows column allocations when the row estimate was short, and reserves
//! string-output slots; the finalize phase copies thread buffers into the
//! output columns without locking (ranges never overlap).

use std::cell::{RefCell, UnsafeCell};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::buffer::WritableBuffer;
use crate::column::storage::str_pos;
use crate::error::{DtError, DtResult};
use crate::parallel::{self, NThreads, SharedLock, SharedMutex, progress};
use crate::read::chunks::{ChunkCoordinates, ChunkPlan, determine_chunking};
use crate::read::columns::ReadColumns;
use crate::read::field::Field64;
use crate::read::parsers::{self, PT, parser_fn};
use crate::read::tokenizer::{Dialect, QuoteRule, Tokenizer};
use crate::util::encodings::{self, EscapeCheck};
use crate::util::logger::ReadLogger;

/// Input and options for one parallel read pass.
pub struct ReaderSettings<'a> {
    pub data: &'a [u8],
    pub sof: usize,
    pub eof: usize,
    pub dialect: &'a Dialect,
    pub fill: bool,
    pub max_nrows: usize,
    pub mean_line_len: f64,
    pub nthreads: usize,
    pub logger: &'a ReadLogger,
}

/// Columns behind the reader's shared mutex: the exclusive side reallocates,
/// the shared side writes into disjoint ranges.
struct SharedColumns<'a> {
    inner: UnsafeCell<&'a mut ReadColumns>,
    lock: SharedMutex,
}

// SAFETY: all access goes through with_shared / with_exclusive, which route
// through the shared mutex.
unsafe impl Sync for SharedColumns<'_> {}

impl<'a> SharedColumns<'a> {
    fn new(columns: &'a mut ReadColumns) -> Self {
        SharedColumns {
            inner: UnsafeCell::new(columns),
            lock: SharedMutex::new(),
        }
    }

    fn with_shared<R>(&self, f: impl FnOnce(&ReadColumns) -> R) -> R {
        let _lock = SharedLock::shared(&self.lock);
        f(unsafe { &**self.inner.get() })
    }

    fn with_exclusive<R>(&self, f: impl FnOnce(&mut ReadColumns) -> R) -> R {
        let _lock = SharedLock::exclusive(&self.lock);
        f(unsafe { &mut **self.inner.get() })
    }
}

/// Shared bump bookkeeping: current parser per column plus reread flags.
struct BumpState {
    types: Vec<AtomicU8>,
    reread: Vec<AtomicBool>,
    record: Mutex<Vec<String>>,
}

impl BumpState {
    fn current(&self, j: usize) -> PT {
        PT::from_u8(self.types[j].load(Ordering::Relaxed))
    }

    /// Widen column `j`'s parser under the critical section; another thread
    /// may have bumped it further already.
    fn bump(&self, j: usize, name: &str, new_pt: PT, row: usize, excerpt: &str) {
        let mut record = self.record.lock().unwrap();
        let old = PT::from_u8(self.types[j].load(Ordering::Relaxed));
        if new_pt > old {
            self.types[j].store(new_pt as u8, Ordering::Relaxed);
            if parsers::needs_reread(old, new_pt) {
                self.reread[j].store(true, Ordering::Relaxed);
            }
            record.push(format!(
                "Column '{}' bumped from {} to {} due to <<{}>> starting around row {}",
                name,
                old.name(),
                new_pt.name(),
                excerpt,
                row,
            ));
        }
    }
}

/// Loop state touched only inside ordered phases, which are serialized.
struct LoopState {
    end_of_last_chunk: usize,
    nrows_written: usize,
}

pub struct ReadOutcome {
    pub nrows_written: usize,
    /// Final parser per column (some may have been bumped mid-read).
    pub final_types: Vec<PT>,
    /// Columns whose storage must be rebuilt in a second pass.
    pub reread_cols: Vec<bool>,
}

pub fn read_all(settings: &ReaderSettings<'_>, columns: &mut ReadColumns) -> DtResult<ReadOutcome> {
    let ncols = columns.ncols();
    let col_names: Vec<String> = columns.cols.iter().map(|c| c.name.clone()).collect();
    let in_buffer: Vec<bool> = columns.cols.iter().map(|c| c.present_in_buffer).collect();
    let bump = BumpState {
        types: columns
            .cols
            .iter()
            .map(|c| AtomicU8::new(c.pt as u8))
            .collect(),
        reread: (0..ncols).map(|_| AtomicBool::new(false)).collect(),
        record: Mutex::new(Vec::new()),
    };

    let input_size = settings.eof - settings.sof;
    let pool_threads = parallel::num_threads_in_pool().min(settings.nthreads.max(1));
    let plan = determine_chunking(
        input_size,
        settings.mean_line_len,
        pool_threads,
        settings.max_nrows,
    );
    settings.logger.info(&format!(
        "The input will be read in {} chunks of size {} each, using {} threads",
        plan.chunk_count, plan.chunk_size, plan.nthreads
    ));

    let start_types: Vec<PT> = columns.cols.iter().map(|c| c.pt).collect();
    let shared = SharedColumns::new(columns);
    let state = UnsafeCell::new(LoopState {
        end_of_last_chunk: settings.sof,
        nrows_written: 0,
    });
    // SAFETY: LoopState is only dereferenced inside ordered phases, which
    // run one at a time under the loop's global mutex.
    #[derive(Clone, Copy)]
    struct StatePtr(*mut LoopState);
    unsafe impl Send for StatePtr {}
    unsafe impl Sync for StatePtr {}
    let state_ptr = StatePtr(state.get());

    progress::start_work("reading input");

    let reader = ChunkReader {
        s: settings,
        bump: &bump,
        plan,
        ncols,
        col_names: &col_names,
        in_buffer: &in_buffer,
        start_types: &start_types,
    };

    parallel::parallel_for_ordered(plan.chunk_count, NThreads::new(plan.nthreads), |octx| {
        let state_ptr = state_ptr;
        let tctx = RefCell::new(ThreadContext::new(&reader, &shared));
        octx.exec(
            |i| {
                let mut ctx = tctx.borrow_mut();
                let eolc = unsafe {
                    // chunk 0 and single-threaded plans read the serial
                    // cursor; all other chunks start from arithmetic.
                    if i == 0 || reader.plan.nthreads == 1 {
                        (*state_ptr.0).end_of_last_chunk
                    } else {
                        settings.sof
                    }
                };
                let xcc =
                    reader
                        .plan
                        .chunk_coordinates(i, settings.sof, settings.eof, eolc);
                ctx.read_chunk(xcc)
            },
            |i, octx| {
                let mut ctx = tctx.borrow_mut();
                let state = unsafe { &mut *state_ptr.0 };

                // Reconcile chunk boundaries: the actual start must meet the
                // previous chunk's end, else re-read from the exact spot.
                for attempt in 0..2 {
                    if ctx.acc_end.is_some() && ctx.acc_start == state.end_of_last_chunk {
                        break;
                    }
                    debug_assert_eq!(attempt, 0, "exact re-read cannot misalign");
                    let xcc = ChunkCoordinates {
                        start: state.end_of_last_chunk,
                        end: ctx.xcc.end.max(state.end_of_last_chunk),
                        true_start: true,
                        true_end: ctx.xcc.true_end,
                    };
                    ctx.read_chunk(xcc)?;
                }
                let end = ctx.acc_end.expect("exact chunk read yields an end");
                debug_assert!(end >= state.end_of_last_chunk);
                state.end_of_last_chunk = end;

                ctx.row0 = state.nrows_written;
                let mut nrows_new = state.nrows_written + ctx.used_nrows;
                let allocated = shared.with_shared(|c| c.nrows_allocated);
                if nrows_new > allocated {
                    if nrows_new >= reader.s.max_nrows {
                        ctx.used_nrows = reader.s.max_nrows - state.nrows_written;
                        nrows_new = reader.s.max_nrows;
                        reader.realloc_columns(&shared, i, nrows_new)?;
                        octx.set_n_iterations(i + 1);
                    } else {
                        reader.realloc_columns(&shared, i, nrows_new)?;
                    }
                }
                state.nrows_written = nrows_new;

                ctx.order_string_buffers()?;

                if input_size > 0 {
                    progress::set_fraction(
                        (state.end_of_last_chunk - settings.sof) as f64 / input_size as f64,
                    );
                }
                Ok(())
            },
            |_i| {
                let mut ctx = tctx.borrow_mut();
                ctx.push_buffers();
                Ok(())
            },
        );
    })?;

    progress::finish();
    drop(shared);

    let state = state.into_inner();
    for msg in bump.record.lock().unwrap().iter() {
        settings.logger.warn(msg);
    }

    let final_types: Vec<PT> = (0..ncols).map(|j| bump.current(j)).collect();
    let reread_cols: Vec<bool> = bump
        .reread
        .iter()
        .map(|b| b.load(Ordering::Relaxed))
        .collect();
    for (j, col) in columns.cols.iter_mut().enumerate() {
        col.pt = final_types[j];
        col.type_bumped = reread_cols[j];
    }
    Ok(ReadOutcome {
        nrows_written: state.nrows_written,
        final_types,
        reread_cols,
    })
}

struct ChunkReader<'a> {
    s: &'a ReaderSettings<'a>,
    bump: &'a BumpState,
    plan: ChunkPlan,
    ncols: usize,
    col_names: &'a [String],
    in_buffer: &'a [bool],
    /// Parser of each column when the pass started. Thread string buffers
    /// are laid out from these: a column bumped to string mid-pass has no
    /// output writer and is deferred to the reread pass.
    start_types: &'a [PT],
}

impl ChunkReader<'_> {
    /// Grow all column allocations under the exclusive lock. The new size
    /// extrapolates from the rows seen so far across the chunks read.
    fn realloc_columns(
        &self,
        shared: &SharedColumns<'_>,
        ichunk: usize,
        new_nrows: usize,
    ) -> DtResult<()> {
        let allocated = shared.with_shared(|c| c.nrows_allocated);
        if new_nrows == allocated {
            return Ok(());
        }
        let mut target = new_nrows;
        if ichunk < self.plan.chunk_count - 1 {
            let expected =
                1.2 * new_nrows as f64 * self.plan.chunk_count as f64 / (ichunk + 1) as f64;
            target = (expected as usize).max(allocated + 1024);
        }
        target = target.min(self.s.max_nrows);
        self.s
            .logger
            .info(&format!("Too few rows allocated, reallocating to {target} rows"));
        shared.with_exclusive(|c| c.allocate(target))
    }
}

/// Per-string-column slice of the thread buffer.
struct StrBufLocal {
    /// Column index in the frame.
    col_idx: usize,
    /// Slot index in the thread buffer row.
    buf_idx: usize,
    bytes: Vec<u8>,
    /// Reserved offset in the column's output writer.
    write_base: usize,
    write_size: usize,
}

struct ThreadContext<'a, 'c> {
    r: &'a ChunkReader<'a>,
    shared: &'a SharedColumns<'c>,
    /// Map column index -> thread-buffer slot.
    buf_slot: Vec<Option<usize>>,
    tbuf_ncols: usize,
    tbuf: Vec<Field64>,
    tbuf_nrows: usize,
    strbufs: Vec<StrBufLocal>,
    used_nrows: usize,
    row0: usize,
    anchor: usize,
    xcc: ChunkCoordinates,
    acc_start: usize,
    acc_end: Option<usize>,
}

impl<'a, 'c> ThreadContext<'a, 'c> {
    fn new(r: &'a ChunkReader<'a>, shared: &'a SharedColumns<'c>) -> Self {
        let mut buf_slot = Vec::with_capacity(r.ncols);
        let mut slot = 0usize;
        let mut strbufs = Vec::new();
        for j in 0..r.ncols {
            if r.in_buffer[j] {
                if r.start_types[j].is_string() {
                    strbufs.push(StrBufLocal {
                        col_idx: j,
                        buf_idx: slot,
                        bytes: Vec::with_capacity(4096),
                        write_base: 0,
                        write_size: 0,
                    });
                }
                buf_slot.push(Some(slot));
                slot += 1;
            } else {
                buf_slot.push(None);
            }
        }
        let tbuf_nrows = 128;
        ThreadContext {
            r,
            shared,
            buf_slot,
            tbuf_ncols: slot,
            tbuf: vec![Field64::default(); tbuf_nrows * slot.max(1)],
            tbuf_nrows,
            strbufs,
            used_nrows: 0,
            row0: 0,
            anchor: 0,
            xcc: ChunkCoordinates {
                start: 0,
                end: 0,
                true_start: false,
                true_end: false,
            },
            acc_start: 0,
            acc_end: None,
        }
    }

    fn grow_tbuf(&mut self) {
        self.tbuf_nrows = self.tbuf_nrows * 3 / 2;
        self.tbuf
            .resize(self.tbuf_nrows * self.tbuf_ncols.max(1), Field64::default());
    }

    /// Parse the chunk with coordinates `cc`. Fills `used_nrows` rows of the
    /// thread buffer and records the actual coordinates. A structural error
    /// in a chunk whose start was only approximate leaves `acc_end == None`
    /// (the ordered phase re-reads from the exact position); with a true
    /// start it is a real error.
    fn read_chunk(&mut self, cc: ChunkCoordinates) -> DtResult<()> {
        let s = self.r.s;
        self.xcc = cc;
        self.used_nrows = 0;
        self.acc_start = cc.start;
        self.acc_end = None;
        for sb in &mut self.strbufs {
            sb.bytes.clear();
        }

        let mut tok = Tokenizer {
            data: s.data,
            ch: cc.start,
            eof: s.eof,
            anchor: cc.start,
            dialect: s.dialect,
        };
        if !cc.true_start && !tok.next_good_line(self.r.ncols, s.fill) {
            return Ok(());
        }
        self.acc_start = tok.ch;
        self.anchor = tok.ch;
        tok.anchor = tok.ch;

        let ncols = self.r.ncols;
        let sep = s.dialect.sep;
        let quote = s.dialect.quote;
        let fast_allowed = sep != b' '
            && !s.dialect.numbers_may_be_nas
            && s.dialect.quote_rule != QuoteRule::None;
        let fillme = s.fill || (ncols == 1 && !s.dialect.skip_blank_lines);
        let mut scratch = Field64::default();

        'rows: while tok.ch < cc.end && !tok.at_eof() {
            if self.used_nrows == self.tbuf_nrows {
                self.grow_tbuf();
            }
            let line_start = tok.ch;
            let row_base = self.used_nrows * self.tbuf_ncols;
            let mut j = 0usize;

            if fast_allowed {
                // Fast path: no whitespace, no quoted numerics, "," == NA.
                while j < ncols {
                    let pt = self.r.bump.current(j);
                    let target = match self.buf_slot[j] {
                        Some(slot) => &mut self.tbuf[row_base + slot],
                        None => &mut scratch,
                    };
                    parser_fn(pt)(&mut tok, target);
                    if tok.cur() != sep {
                        break;
                    }
                    tok.ch += 1;
                    j += 1;
                }
                if tok.ch == line_start {
                    tok.skip_white();
                    if tok.at_eof() {
                        break 'rows;
                    }
                    if s.dialect.skip_blank_lines && tok.skip_eol() {
                        continue 'rows;
                    }
                } else {
                    let before_eol = tok.ch;
                    if tok.skip_eol() {
                        // the parser finished field j and hit end of line
                        j += 1;
                        if j == ncols {
                            self.used_nrows += 1;
                            continue 'rows;
                        }
                        tok.ch = before_eol;
                    } else if tok.at_eof() {
                        j += 1;
                        if j == ncols {
                            self.used_nrows += 1;
                            break 'rows;
                        }
                    }
                }
                // fall through to the per-field path, restarting the row
                tok.ch = line_start;
                j = 0;
            }

            if sep == b' ' {
                while tok.cur() == b' ' {
                    tok.ch += 1;
                }
                if s.dialect.skip_blank_lines && (tok.at_eol() || tok.at_eof()) {
                    if !tok.skip_eol() {
                        break 'rows;
                    }
                    continue 'rows;
                }
            } else if !fast_allowed
                && s.dialect.skip_blank_lines
                && tok.ch == line_start
                && tok.skip_eol()
            {
                continue 'rows;
            }

            if fillme || !(tok.at_eol() || tok.at_eof()) {
                while j < ncols {
                    let field_start = tok.ch;
                    let old_pt = self.r.bump.current(j);
                    let mut cur_pt = old_pt;
                    loop {
                        tok.ch = field_start;
                        let mut quoted = false;
                        if !cur_pt.is_string() {
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
                        let target = match self.buf_slot[j] {
                            Some(slot) => &mut self.tbuf[row_base + slot],
                            None => &mut scratch,
                        };
                        parser_fn(cur_pt)(&mut tok, target);
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
                                if sep == b' ' && tok.cur() == b' ' {
                                    while tok.at(tok.ch + 1) == b' ' {
                                        tok.ch += 1;
                                    }
                                    let nxt = tok.at(tok.ch + 1);
                                    if nxt == b'\r' || nxt == b'\n' || tok.ch + 1 >= tok.eof {
                                        tok.ch += 1;
                                    }
                                }
                                break;
                            }
                        }
                        // out-of-sample value: try the next, more permissive
                        // parser for this column
                        match cur_pt.successor(sep) {
                            Some(next) => cur_pt = next,
                            None => {
                                return self.structural_error(
                                    cc,
                                    format!(
                                        "Cannot parse field {} of row {} under any known type",
                                        j + 1,
                                        self.row0 + self.used_nrows
                                    ),
                                );
                            }
                        }
                    }
                    if cur_pt != old_pt {
                        let excerpt_end = tok.ch.min(field_start + 32);
                        let excerpt =
                            String::from_utf8_lossy(&s.data[field_start..excerpt_end]).into_owned();
                        self.r.bump.bump(
                            j,
                            &self.r.col_names[j],
                            cur_pt,
                            self.row0 + self.used_nrows,
                            &excerpt,
                        );
                    }
                    j += 1;
                    if tok.cur() == sep && !tok.at_eof() {
                        tok.ch += 1;
                        continue;
                    }
                    if s.fill && (tok.at_eol() || tok.at_eof()) && j <= ncols {
                        // remaining fields read as empty -> NA
                        continue;
                    }
                    break;
                }
            }

            if j < ncols {
                return self.structural_error(
                    cc,
                    format!(
                        "Expected {} columns but row {} contains only {} (sep='{}'); \
                         consider fill=true",
                        ncols,
                        self.row0 + self.used_nrows,
                        j,
                        sep as char
                    ),
                );
            }
            if !tok.skip_eol() && !tok.at_eof() {
                return self.structural_error(
                    cc,
                    format!(
                        "Too many fields on row {}: read all {} expected columns but more \
                         data remains",
                        self.row0 + self.used_nrows,
                        ncols
                    ),
                );
            }
            self.used_nrows += 1;
        }

        self.acc_end = Some(tok.ch);
        self.postprocess_strings();
        Ok(())
    }

    /// A malformed row inside an approximately-started chunk usually means
    /// the line recovery picked a spot inside a quoted field; the ordered
    /// phase will re-read from the exact boundary. With a true start the
    /// input itself is bad.
    fn structural_error(&mut self, cc: ChunkCoordinates, msg: String) -> DtResult<()> {
        if cc.true_start {
            Err(DtError::ValueError(msg))
        } else {
            self.acc_end = None;
            Ok(())
        }
    }

    /// Decode string fields out of the raw input into the thread's string
    /// byte buffers, converting tbuf entries into running local offsets
    /// (negative-biased for NA).
    fn postprocess_strings(&mut self) {
        if self.strbufs.is_empty() {
            return;
        }
        let s = self.r.s;
        let echar = match s.dialect.quote_rule {
            QuoteRule::Doubled => s.dialect.quote,
            QuoteRule::Escaped => b'\\',
            _ => 0xFF,
        };
        for k in 0..self.strbufs.len() {
            let buf_idx = self.strbufs[k].buf_idx;
            let col_idx = self.strbufs[k].col_idx;
            if self.r.bump.reread[col_idx].load(Ordering::Relaxed) {
                continue;
            }
            for row in 0..self.used_nrows {
                let slot = row * self.tbuf_ncols + buf_idx;
                let (off, len) = self.tbuf[slot].get_str();
                let sb = &mut self.strbufs[k];
                if len < 0 {
                    let pos = sb.bytes.len() as i64;
                    self.tbuf[slot].set_i64(-pos - 1);
                    continue;
                }
                if len > 0 {
                    let start = self.anchor + off as usize;
                    let src = &s.data[start..start + len as usize];
                    match encodings::check_escaped_string(src, echar) {
                        EscapeCheck::Clean => sb.bytes.extend_from_slice(src),
                        EscapeCheck::HasEscapes => encodings::decode_escaped(src, echar, &mut sb.bytes),
                        EscapeCheck::NotUtf8 => {
                            let mut repaired = Vec::with_capacity(src.len() * 3);
                            encodings::decode_win1252(src, &mut repaired);
                            encodings::decode_escaped(&repaired, echar, &mut sb.bytes);
                        }
                    }
                }
                let end = self.strbufs[k].bytes.len() as i64;
                self.tbuf[slot].set_i64(end);
            }
        }
    }

    /// Ordered phase: reserve each string column's output slot so that the
    /// finalize phase can copy without synchronization. Reservation order is
    /// the chunk order, keeping string bytes laid out in row order.
    fn order_string_buffers(&mut self) -> DtResult<()> {
        for k in 0..self.strbufs.len() {
            let col_idx = self.strbufs[k].col_idx;
            if self.r.bump.reread[col_idx].load(Ordering::Relaxed) {
                continue;
            }
            // The buffer may hold more rows than were finally used (the
            // max_nrows truncation); size from the last used row.
            let sz = if self.used_nrows == 0 {
                0
            } else {
                let slot = (self.used_nrows - 1) * self.tbuf_ncols + self.strbufs[k].buf_idx;
                str_pos(self.tbuf[slot].get_i64())
            };
            let (base, is_str32) = self.shared.with_shared(|cols| {
                let col = &cols.cols[col_idx];
                let wb = col.strbuf.as_ref().expect("string column has a writer");
                (wb.prep_write(sz), col.pt == PT::Str32)
            });
            if is_str32 && base + sz > i32::MAX as usize {
                // 2GB of string data does not fit 32-bit offsets
                self.r.bump.bump(
                    col_idx,
                    &self.r.col_names[col_idx],
                    PT::Str64,
                    self.row0,
                    "<2GB+ of string data>",
                );
            }
            self.strbufs[k].write_base = base;
            self.strbufs[k].write_size = sz;
        }
        Ok(())
    }

    /// Finalize phase: copy the thread buffer into the output columns.
    /// Ranges from different chunks never overlap, so only the shared lock
    /// (against concurrent reallocation) is needed.
    fn push_buffers(&mut self) {
        if self.used_nrows == 0 {
            return;
        }
        let row0 = self.row0;
        let used = self.used_nrows;
        self.shared.with_shared(|cols| {
            let mut str_k = 0usize;
            for (j, col) in cols.cols.iter().enumerate() {
                let Some(slot) = self.buf_slot[j] else { continue };
                let pt = self.r.bump.current(j);
                if self.r.bump.reread[j].load(Ordering::Relaxed) || pt == PT::Mu {
                    // storage will be rebuilt in the reread pass
                    if col.is_string()
                        && str_k < self.strbufs.len()
                        && self.strbufs[str_k].col_idx == j
                    {
                        str_k += 1;
                    }
                    continue;
                }
                if col.is_string() {
                    let sb = &self.strbufs[str_k];
                    debug_assert_eq!(sb.col_idx, j);
                    str_k += 1;
                    let wb = col.strbuf.as_ref().expect("string writer");
                    wb.write_at(sb.write_base, &sb.bytes[..sb.write_size]);
                    let base = sb.write_base as i64;
                    // SAFETY: offsets [row0+1, row0+used] belong to this
                    // chunk alone; the shared lock excludes reallocation.
                    unsafe {
                        match pt {
                            PT::Str32 => {
                                let out = col.databuf.write_ptr() as *mut i32;
                                for r in 0..used {
                                    let local = self.tbuf[r * self.tbuf_ncols + slot].get_i64();
                                    out.add(row0 + 1 + r).write(rebase32(local, base));
                                }
                            }
                            _ => {
                                let out = col.databuf.write_ptr() as *mut i64;
                                for r in 0..used {
                                    let local = self.tbuf[r * self.tbuf_ncols + slot].get_i64();
                                    out.add(row0 + 1 + r).write(rebase64(local, base));
                                }
                            }
                        }
                    }
                } else {
                    // SAFETY: rows [row0, row0+used) belong to this chunk
                    // alone; the shared lock excludes reallocation.
                    unsafe {
                        let base_ptr = col.databuf.write_ptr();
                        match col.elemsize() {
                            1 => {
                                let out = base_ptr;
                                for r in 0..used {
                                    out.add(row0 + r)
                                        .write(self.tbuf[r * self.tbuf_ncols + slot].get_i8()
                                            as u8);
                                }
                            }
                            4 => {
                                let out = base_ptr as *mut u32;
                                for r in 0..used {
                                    out.add(row0 + r).write(
                                        self.tbuf[r * self.tbuf_ncols + slot].get_i32() as u32,
                                    );
                                }
                            }
                            _ => {
                                let out = base_ptr as *mut u64;
                                for r in 0..used {
                                    out.add(row0 + r).write(
                                        self.tbuf[r * self.tbuf_ncols + slot].get_i64() as u64,
                                    );
                                }
                            }
                        }
                    }
                }
            }
        });
        self.used_nrows = 0;
    }
}

fn rebase64(local: i64, base: i64) -> i64 {
    if local < 0 {
        -(str_pos(local) as i64 + base) - 1
    } else {
        local + base
    }
}

fn rebase32(local: i64, base: i64) -> i32 {
    rebase64(local, base) as i32
}
