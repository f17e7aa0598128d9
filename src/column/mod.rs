//! The column model: materialized storage columns plus virtual columns that
//! compute their elements on demand.
//!
//! The closed set of column kinds is a tagged enum rather than a trait
//! hierarchy. Virtual columns always point strictly "down" to other columns,
//! so no cycles are constructable through the public API.

pub mod cast;
pub mod rowindex;
pub mod stats;
pub mod storage;
pub mod stype;

pub use rowindex::RowIndex;
pub use stats::{Stats, StatsCache};
pub use storage::StorageColumn;
pub use stype::{Element, LType, SType};

use std::borrow::Cow;
use std::sync::Arc;

use crate::buffer::{Buffer, MemoryWritableBuffer, WritableBuffer};
use crate::column::storage::str_pos;
use crate::error::{DtError, DtResult};
use crate::parallel;
use crate::parallel::{ChunkSize, NThreads};

/// The value of a constant column.
#[derive(Debug, Clone)]
pub enum ConstValue {
    Na,
    Int(i64),
    Float(f64),
    Str(Arc<str>),
}

/// A typed sequence of values: either materialized storage or a virtual view.
#[derive(Clone)]
pub enum Column {
    Storage(StorageColumn),
    Const {
        value: ConstValue,
        stype: SType,
        nrows: usize,
    },
    Range {
        start: i64,
        step: i64,
        nrows: usize,
        stype: SType,
    },
    Repeat {
        arg: Box<Column>,
        nrows: usize,
    },
    Sliced {
        arg: Box<Column>,
        start: usize,
        step: isize,
        nrows: usize,
    },
    RowIndexed {
        arg: Box<Column>,
        ri: RowIndex,
    },
    Cast {
        arg: Box<Column>,
        stype: SType,
    },
}

/// A single cell, used by row-wise export and display.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Na,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<StorageColumn> for Column {
    fn from(c: StorageColumn) -> Self {
        Column::Storage(c)
    }
}

impl Column {
    //---- Constructors ------------------------------------------------------

    pub fn void(nrows: usize) -> Column {
        Column::Storage(StorageColumn::void(nrows))
    }

    pub fn const_value(value: ConstValue, stype: SType, nrows: usize) -> Column {
        Column::Const {
            value,
            stype,
            nrows,
        }
    }

    pub fn const_na(stype: SType, nrows: usize) -> Column {
        Column::const_value(ConstValue::Na, stype, nrows)
    }

    /// A range-generated column: element `i` is `start + i*step`, narrowed
    /// to `stype` with wraparound.
    pub fn range(start: i64, stop: i64, step: i64, stype: Option<SType>) -> DtResult<Column> {
        if step == 0 {
            return Err(DtError::value_error("range step cannot be zero"));
        }
        let length = if step > 0 {
            (stop - start + step - 1).div_euclid(step)
        } else {
            (start - stop - step - 1).div_euclid(-step)
        };
        let nrows = length.max(0) as usize;
        let stype = match stype {
            None => {
                let fits32 = start == start as i32 as i64 && stop == stop as i32 as i64;
                if fits32 { SType::Int32 } else { SType::Int64 }
            }
            Some(s) if s.is_numeric() => s,
            Some(s) => {
                return Err(DtError::value_error(format!(
                    "invalid stype {s} for a range column"
                )));
            }
        };
        Ok(Column::Range {
            start,
            step,
            nrows,
            stype,
        })
    }

    //---- Basic properties --------------------------------------------------

    pub fn nrows(&self) -> usize {
        match self {
            Column::Storage(c) => c.nrows(),
            Column::Const { nrows, .. } => *nrows,
            Column::Range { nrows, .. } => *nrows,
            Column::Repeat { nrows, .. } => *nrows,
            Column::Sliced { nrows, .. } => *nrows,
            Column::RowIndexed { ri, .. } => ri.len(),
            Column::Cast { arg, .. } => arg.nrows(),
        }
    }

    pub fn stype(&self) -> SType {
        match self {
            Column::Storage(c) => c.stype(),
            Column::Const { stype, .. } => *stype,
            Column::Range { stype, .. } => *stype,
            Column::Repeat { arg, .. } => arg.stype(),
            Column::Sliced { arg, .. } => arg.stype(),
            Column::RowIndexed { arg, .. } => arg.stype(),
            Column::Cast { stype, .. } => *stype,
        }
    }

    pub fn is_virtual(&self) -> bool {
        !matches!(self, Column::Storage(_))
    }

    //---- Element access ----------------------------------------------------

    /// Fixed-width element access; `T`'s width must match the stype.
    pub fn get<T: Element>(&self, i: usize) -> Option<T> {
        debug_assert!(i < self.nrows());
        match self {
            Column::Storage(c) => c.get::<T>(i),
            Column::Const { value, .. } => match value {
                ConstValue::Na => None,
                ConstValue::Int(v) => Some(T::wrap_from_i64(*v)),
                ConstValue::Float(f) => Some(T::from_f64_cast(*f)),
                ConstValue::Str(_) => None,
            },
            Column::Range { start, step, .. } => {
                Some(T::wrap_from_i64(start.wrapping_add((i as i64).wrapping_mul(*step))))
            }
            Column::Repeat { arg, .. } => arg.get::<T>(i % arg.nrows()),
            Column::Sliced { arg, start, step, .. } => {
                arg.get::<T>((*start as isize + i as isize * step) as usize)
            }
            Column::RowIndexed { arg, ri } => ri.get(i).and_then(|j| arg.get::<T>(j)),
            Column::Cast { arg, stype } => cast::cast_get::<T>(arg, i, *stype),
        }
    }

    /// String element access; valid for string-stype columns.
    pub fn get_str(&self, i: usize) -> Option<Cow<'_, str>> {
        debug_assert!(i < self.nrows());
        match self {
            Column::Storage(c) => c.get_str(i).map(Cow::Borrowed),
            Column::Const { value, .. } => match value {
                ConstValue::Str(s) => Some(Cow::Borrowed(&**s)),
                _ => None,
            },
            Column::Range { .. } => None,
            Column::Repeat { arg, .. } => arg.get_str(i % arg.nrows()),
            Column::Sliced { arg, start, step, .. } => {
                arg.get_str((*start as isize + i as isize * step) as usize)
            }
            Column::RowIndexed { arg, ri } => ri.get(i).and_then(|j| arg.get_str(j)),
            Column::Cast { arg, .. } => cast::cast_get_str(arg, i),
        }
    }

    /// Integer-family element widened to `i64`, regardless of storage width.
    pub fn get_i64_any(&self, i: usize) -> Option<i64> {
        match self.stype() {
            SType::Bool8 | SType::Int8 => self.get::<i8>(i).map(i64::from),
            SType::Int16 => self.get::<i16>(i).map(i64::from),
            SType::Int32 => self.get::<i32>(i).map(i64::from),
            SType::Int64 => self.get::<i64>(i),
            _ => None,
        }
    }

    /// Numeric element as `f64`, regardless of storage width.
    pub fn get_f64_any(&self, i: usize) -> Option<f64> {
        match self.stype() {
            SType::Float32 => self.get::<f32>(i).map(f64::from),
            SType::Float64 => self.get::<f64>(i),
            _ => self.get_i64_any(i).map(|v| v as f64),
        }
    }

    /// The cell as a dynamically-typed value.
    pub fn value(&self, i: usize) -> Value {
        match self.stype().ltype() {
            LType::Void => Value::Na,
            LType::Bool => match self.get::<i8>(i) {
                Some(v) => Value::Bool(v != 0),
                None => Value::Na,
            },
            LType::Int => match self.get_i64_any(i) {
                Some(v) => Value::Int(v),
                None => Value::Na,
            },
            LType::Real => match self.get_f64_any(i) {
                Some(v) => Value::Float(v),
                None => Value::Na,
            },
            LType::Str => match self.get_str(i) {
                Some(s) => Value::Str(s.into_owned()),
                None => Value::Na,
            },
        }
    }

    //---- Virtual-column operators ------------------------------------------

    /// Repeat this column `ntimes` times. A 1-row column collapses into a
    /// constant; repeating a repeat merely extends it.
    pub fn repeat(self, ntimes: usize) -> DtResult<Column> {
        if ntimes == 0 {
            return Err(DtError::value_error("cannot repeat a column zero times"));
        }
        if ntimes == 1 {
            return Ok(self);
        }
        let nrows = self.nrows();
        if nrows == 0 {
            return Ok(self);
        }
        if nrows == 1 {
            // A repeated 1-row column would recurse forever through `i % 1`;
            // collapse into a constant instead.
            let stype = self.stype();
            let value = match self.value(0) {
                Value::Na => ConstValue::Na,
                Value::Bool(b) => ConstValue::Int(b as i64),
                Value::Int(v) => ConstValue::Int(v),
                Value::Float(f) => ConstValue::Float(f),
                Value::Str(s) => ConstValue::Str(s.into()),
            };
            return Ok(Column::const_value(value, stype, ntimes));
        }
        match self {
            Column::Repeat { arg, nrows } => Ok(Column::Repeat {
                arg,
                nrows: nrows * ntimes,
            }),
            Column::Const {
                value,
                stype,
                nrows,
            } => Ok(Column::Const {
                value,
                stype,
                nrows: nrows * ntimes,
            }),
            other => Ok(Column::Repeat {
                arg: Box::new(other),
                nrows: nrows * ntimes,
            }),
        }
    }

    /// View of this column through a row index.
    pub fn apply_rowindex(self, ri: RowIndex) -> Column {
        match ri {
            RowIndex::Slice { start, step, len } => Column::Sliced {
                arg: Box::new(self),
                start,
                step,
                nrows: len,
            },
            other => Column::RowIndexed {
                arg: Box::new(self),
                ri: other,
            },
        }
    }

    /// Slice view: rows `start, start+step, ...` of length `len`.
    pub fn slice(self, start: usize, step: isize, len: usize) -> Column {
        Column::Sliced {
            arg: Box::new(self),
            start,
            step,
            nrows: len,
        }
    }

    /// Cast view to another stype.
    pub fn cast(self, stype: SType) -> Column {
        if self.stype() == stype {
            return self;
        }
        if self.stype() == SType::Void {
            return Column::const_na(stype, self.nrows());
        }
        Column::Cast {
            arg: Box::new(self),
            stype,
        }
    }

    //---- Stats -------------------------------------------------------------

    /// Column statistics; cached on storage columns, computed fresh for
    /// virtual ones.
    pub fn stats(&self) -> DtResult<Arc<Stats>> {
        if let Column::Storage(c) = self {
            if let Some(s) = c.stats_cache().get() {
                return Ok(s);
            }
            let s = Arc::new(stats::compute_stats(self)?);
            c.stats_cache().set(Arc::clone(&s));
            return Ok(s);
        }
        Ok(Arc::new(stats::compute_stats(self)?))
    }

    //---- Materialization ---------------------------------------------------

    /// Turn the column into materialized storage. Fixed-width columns fill
    /// their buffer in parallel; string columns go through the ordered
    /// primitive because offsets are cumulative.
    pub fn materialize(&self) -> DtResult<StorageColumn> {
        if let Column::Storage(c) = self {
            return Ok(c.clone());
        }
        let stype = self.stype();
        match stype {
            SType::Void => Ok(StorageColumn::void(self.nrows())),
            SType::Bool8 | SType::Int8 => self.materialize_fw::<i8>(),
            SType::Int16 => self.materialize_fw::<i16>(),
            SType::Int32 => self.materialize_fw::<i32>(),
            SType::Int64 => self.materialize_fw::<i64>(),
            SType::Float32 => self.materialize_fw::<f32>(),
            SType::Float64 => self.materialize_fw::<f64>(),
            SType::Str32 | SType::Str64 => self.materialize_str(),
        }
    }

    /// Same as [`materialize`], returning a column.
    pub fn materialized(self) -> DtResult<Column> {
        Ok(Column::Storage(self.materialize()?))
    }

    fn materialize_fw<T: Element>(&self) -> DtResult<StorageColumn> {
        let n = self.nrows();
        let buf = Buffer::with_len(n * size_of::<T>())?;
        // SAFETY: the buffer is freshly allocated and uniquely held; each
        // loop chunk writes a disjoint index range.
        let ptr = SendPtr(unsafe { buf.write_ptr() } as *mut T);
        parallel::parallel_for_static(n, ChunkSize::new(4096), |i0, i1| {
            let ptr = ptr;
            for i in i0..i1 {
                let v = self.get::<T>(i).unwrap_or_else(T::na);
                unsafe {
                    ptr.0.add(i).write(v);
                }
            }
        })?;
        StorageColumn::from_buffers(self.stype(), n, buf, None)
    }

    fn materialize_str(&self) -> DtResult<StorageColumn> {
        let n = self.nrows();
        let stype = self.stype();
        let offsets = Buffer::with_len((n + 1) * stype.elemsize())?;
        let wb = MemoryWritableBuffer::new(n * 8);

        const CHUNK_ROWS: usize = 4096;
        let nchunks = n.div_ceil(CHUNK_ROWS).max(1);
        // SAFETY: chunks write disjoint offset ranges; entry 0 is written by
        // chunk 0 only.
        let offp = SendPtr(unsafe { offsets.write_ptr() });

        struct StrChunk {
            bytes: Vec<u8>,
            ends: Vec<i64>,
            base: usize,
            row0: usize,
        }

        parallel::parallel_for_ordered(
            nchunks,
            NThreads::from_niters(nchunks, 2),
            |ctx| {
                let offp = offp;
                let local = std::cell::RefCell::new(StrChunk {
                    bytes: Vec::new(),
                    ends: Vec::new(),
                    base: 0,
                    row0: 0,
                });
                ctx.exec(
                    |i| {
                        let mut ch = local.borrow_mut();
                        ch.row0 = i * CHUNK_ROWS;
                        let r1 = (ch.row0 + CHUNK_ROWS).min(n);
                        ch.bytes.clear();
                        ch.ends.clear();
                        for r in ch.row0..r1 {
                            match self.get_str(r) {
                                Some(s) => {
                                    ch.bytes.extend_from_slice(s.as_bytes());
                                    let end = ch.bytes.len() as i64;
                                    ch.ends.push(end);
                                }
                                None => {
                                    let pos = ch.bytes.len() as i64;
                                    ch.ends.push(-pos - 1);
                                }
                            }
                        }
                        Ok(())
                    },
                    |_i, _o| {
                        let mut ch = local.borrow_mut();
                        ch.base = wb.prep_write(ch.bytes.len());
                        if stype == SType::Str32
                            && ch.base + ch.bytes.len() > i32::MAX as usize
                        {
                            return Err(DtError::OverflowError(
                                "str32 column exceeds 2GB of string data".into(),
                            ));
                        }
                        Ok(())
                    },
                    |_i| {
                        let ch = local.borrow();
                        wb.write_at(ch.base, &ch.bytes);
                        let base = ch.base as i64;
                        unsafe {
                            if stype == SType::Str32 {
                                let out = offp.0 as *mut i32;
                                if ch.row0 == 0 {
                                    out.write(0);
                                }
                                for (k, &end) in ch.ends.iter().enumerate() {
                                    let g = rebase_offset(end, base);
                                    out.add(ch.row0 + 1 + k).write(g as i32);
                                }
                            } else {
                                let out = offp.0 as *mut i64;
                                if ch.row0 == 0 {
                                    out.write(0);
                                }
                                for (k, &end) in ch.ends.iter().enumerate() {
                                    out.add(ch.row0 + 1 + k).write(rebase_offset(end, base));
                                }
                            }
                        }
                        Ok(())
                    },
                );
            },
        )?;

        let mut wb = wb;
        let strdata = wb.finalize()?;
        StorageColumn::from_buffers(stype, n, offsets, Some(strdata))
    }
}

/// Shift a chunk-local string offset to its global position, preserving the
/// NA sign-and-bias encoding.
fn rebase_offset(local: i64, base: i64) -> i64 {
    if local < 0 {
        -((str_pos(local) as i64) + base) - 1
    } else {
        local + base
    }
}

#[derive(Clone, Copy)]
struct SendPtr<T>(*mut T);

// SAFETY: raw pointers into buffers whose disjoint-write discipline is
// documented at each use site.
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_lengths_and_values() {
        let c = Column::range(0, 10, 3, None).unwrap();
        assert_eq!(c.nrows(), 4);
        let vals: Vec<_> = (0..4).map(|i| c.get::<i32>(i).unwrap()).collect();
        assert_eq!(vals, vec![0, 3, 6, 9]);

        let c = Column::range(10, 0, -3, None).unwrap();
        assert_eq!(c.nrows(), 4);
        let vals: Vec<_> = (0..4).map(|i| c.get::<i32>(i).unwrap()).collect();
        assert_eq!(vals, vec![10, 7, 4, 1]);
    }

    #[test]
    fn test_materialize_equals_virtual() {
        let c = Column::range(5, 105, 5, None).unwrap();
        let m = c.materialize().unwrap();
        assert_eq!(m.nrows(), c.nrows());
        for i in 0..c.nrows() {
            assert_eq!(m.get::<i32>(i), c.get::<i32>(i));
        }
    }

    #[test]
    fn test_repeat_of_single_row_collapses() {
        let base = Column::Storage(StorageColumn::from_values::<i32>(&[Some(42)]));
        let rep = base.repeat(1_000_000).unwrap();
        assert_eq!(rep.nrows(), 1_000_000);
        assert!(matches!(rep, Column::Const { .. }));
        assert_eq!(rep.get::<i32>(0), Some(42));
        assert_eq!(rep.get::<i32>(999_999), Some(42));
    }

    #[test]
    fn test_repeat_cycles_values() {
        let base = Column::Storage(StorageColumn::from_values::<i64>(&[
            Some(1),
            Some(2),
            None,
        ]));
        let rep = base.repeat(3).unwrap();
        assert_eq!(rep.nrows(), 9);
        assert_eq!(rep.get::<i64>(4), Some(2));
        assert_eq!(rep.get::<i64>(5), None);
        assert_eq!(rep.get::<i64>(6), Some(1));
    }

    #[test]
    fn test_repeat_zero_is_error() {
        let base = Column::Storage(StorageColumn::from_values::<i32>(&[Some(1)]));
        assert!(base.repeat(0).is_err());
    }

    #[test]
    fn test_identity_rowindex_is_value_equal() {
        let c = Column::range(0, 50, 1, None).unwrap();
        let idx = RowIndex::identity(50);
        let v = c.clone().apply_rowindex(idx);
        for i in 0..50 {
            assert_eq!(v.get::<i32>(i), c.get::<i32>(i));
        }
    }

    #[test]
    fn test_rowindexed_composition() {
        let base = Column::Storage(StorageColumn::from_values::<i32>(&[
            Some(10),
            Some(20),
            Some(30),
            Some(40),
        ]));
        let r1 = RowIndex::from_i32(vec![3, 2, 1, 0]);
        let r2 = RowIndex::from_i32(vec![0, 2, -1]);
        let nested = base
            .clone()
            .apply_rowindex(r1.clone())
            .apply_rowindex(r2.clone());
        let composed = base.apply_rowindex(r1.compose(&r2));
        assert_eq!(nested.nrows(), composed.nrows());
        for i in 0..nested.nrows() {
            assert_eq!(nested.get::<i32>(i), composed.get::<i32>(i));
        }
    }

    #[test]
    fn test_rowindexed_na() {
        let base = Column::Storage(StorageColumn::from_values::<i32>(&[Some(7), Some(8)]));
        let v = base.apply_rowindex(RowIndex::from_i32(vec![1, -1, 0]));
        assert_eq!(v.get::<i32>(0), Some(8));
        assert_eq!(v.get::<i32>(1), None);
        assert_eq!(v.get::<i32>(2), Some(7));
    }

    #[test]
    fn test_sliced_strings() {
        let base = Column::Storage(StorageColumn::from_strs(&[
            Some("a"),
            Some("b"),
            Some("c"),
            Some("d"),
        ]));
        let s = base.slice(1, 2, 2);
        assert_eq!(s.get_str(0).as_deref(), Some("b"));
        assert_eq!(s.get_str(1).as_deref(), Some("d"));
    }

    #[test]
    fn test_materialize_strings_with_na() {
        // large enough to split into several ordered chunks
        let base = Column::Storage(StorageColumn::from_strs(&[
            None,
            Some("alpha"),
            Some(""),
            Some("omega"),
        ]));
        let rep = base.repeat(10_000).unwrap();
        let m = rep.materialize().unwrap();
        assert_eq!(m.nrows(), 40_000);
        for k in (0..10_000).step_by(61) {
            assert_eq!(m.get_str(4 * k), None);
            assert_eq!(m.get_str(4 * k + 1), Some("alpha"));
            assert_eq!(m.get_str(4 * k + 2), Some(""));
            assert_eq!(m.get_str(4 * k + 3), Some("omega"));
        }
    }

    #[test]
    fn test_cast_int_to_float() {
        let c = Column::Storage(StorageColumn::from_values::<i32>(&[
            Some(1),
            None,
            Some(-5),
        ]));
        let f = c.cast(SType::Float64);
        assert_eq!(f.get::<f64>(0), Some(1.0));
        assert_eq!(f.get::<f64>(1), None);
        assert_eq!(f.get::<f64>(2), Some(-5.0));
    }

    #[test]
    fn test_range_narrowing_wraps() {
        let c = Column::Range {
            start: 300,
            step: 1,
            nrows: 2,
            stype: SType::Int8,
        };
        assert_eq!(c.get::<i8>(0), Some(300i64 as i8));
    }
}
